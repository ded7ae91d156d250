mod postgresql;

pub use postgresql::*;
