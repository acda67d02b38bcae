pub mod owners;
pub mod price;
pub mod value;
