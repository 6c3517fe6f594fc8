pub mod handler;


pub use handler::{Answer, Traffic};
