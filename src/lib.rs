pub mod api;
pub mod dialect;
pub mod routing;
pub mod test_util;
pub mod util;
pub mod wire;
