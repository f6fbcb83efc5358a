pub mod calendar;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod model;
pub mod normalize;
pub mod reconcile;
pub mod run;
pub mod sanitize;
pub mod source;
