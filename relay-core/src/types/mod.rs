pub use events::*;
pub use http::*;
pub use relay::*;
pub use relay_request::*;

mod events;
mod http;
mod relay;
mod relay_request;
