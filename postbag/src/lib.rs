pub mod controller;
pub mod runtime;
pub mod seed;
pub mod transport;
