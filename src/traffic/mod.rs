pub mod burst;
pub mod periodic;
