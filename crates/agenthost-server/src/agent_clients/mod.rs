pub mod docker;
pub mod fly_machines;
