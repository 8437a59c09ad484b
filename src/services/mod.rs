pub mod forecast;
pub mod line;
pub mod registry;
pub mod responder;
pub mod scheduler;
pub mod weather;
