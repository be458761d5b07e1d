pub mod forward;
pub mod socks5;
pub mod tcp;

pub use tcp::TcpProxy;
