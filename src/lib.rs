pub mod checkpoint;
pub mod data;
pub mod metric;
pub mod model;
pub mod module;
pub mod schedule;
pub mod training;
