pub mod profile;
pub mod simulate;
