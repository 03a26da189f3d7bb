pub mod loglines;
pub mod reservations;
pub mod servers;
