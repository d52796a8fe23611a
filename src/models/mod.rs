//! Data models for Webex entities

pub mod message;
pub mod person;
pub mod room;
