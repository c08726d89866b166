pub mod rest;
pub mod ws;

pub use rest::RestClient;
pub use ws::WsExchangeClient;
