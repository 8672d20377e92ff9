//! Resumable pipeline for fetching ALKIS parcel archives from the
//! Schleswig-Holstein geodata portal and converting them to shapefiles.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod convert;
pub mod download;
pub mod error;
