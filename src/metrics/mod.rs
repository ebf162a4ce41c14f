pub mod agent;
pub mod cpu;
pub mod factory;
pub mod load;
