//! Citizen-submitted emergency reports and their lifecycle.

pub mod model;

pub use model::{Coordinate, NewReport, Report, ReportId, ReportStatus};
