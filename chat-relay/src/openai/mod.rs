pub mod api;
pub mod relay;
pub mod stream;
pub mod upstream;
