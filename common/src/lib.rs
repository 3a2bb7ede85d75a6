pub mod controllers;
pub mod error;
pub mod storage;
pub mod utils;
