//! Result type alias for the exporter
//!
//! This module provides a convenient Result type alias that uses ExporterError
//! as the error type.

use super::errors::ExporterError;

/// Result type alias for exporter operations
///
/// # Examples
///
/// ```
/// use medication_exporter::domain::result::Result;
/// use medication_exporter::domain::errors::ExporterError;
///
/// fn example_function() -> Result<String> {
///     Ok("success".to_string())
/// }
///
/// fn failing_function() -> Result<()> {
///     Err(ExporterError::Validation("Invalid input".to_string()))
/// }
/// ```
pub type Result<T> = std::result::Result<T, ExporterError>;
