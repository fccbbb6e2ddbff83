pub mod errors;
pub mod location;
pub mod path;
