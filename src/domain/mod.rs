//! Domain types and DTOs
//!
//! These types define the data structures for preconstruction entities.

pub mod bid_forms;
pub mod bid_packages;
pub mod diagrams;
pub mod extraction;
pub mod line_items;
pub mod projects;
pub mod users;
