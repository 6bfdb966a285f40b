pub mod app;
pub mod http;
pub mod router;
pub mod server;
pub mod subsystems;

#[cfg(test)]
mod test_support;

pub use app::AppState;
