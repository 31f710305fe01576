//! Sensor access: the HTTP export client and its CSV parsers.

mod client;
pub mod parse;

pub use client::{CollectionWindow, Endpoint, Fetched, SensorClient};
pub use parse::{
    parse_people_counting, parse_regional, LocalClock, PeopleCountRow, Parsed, RegionalRow,
};
