mod application;
mod supervisor;

pub use application::{encode, Application, Fault};
pub use supervisor::Supervisor;
