mod defer;

pub use defer::{defer, DeferGuard};
