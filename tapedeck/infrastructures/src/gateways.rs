pub mod selectors;
pub mod toolchains;
