use std::path::Path;

use crate::error::{PhenoplierError, Result};

pub fn check_equal_length(
    left_len: usize,
    right_len: usize,
    left_name: &str,
    right_name: &str,
) -> Result<()> {
    if left_len != right_len {
        return Err(PhenoplierError::InvalidInput(format!(
            "Length of {left_name} ({left_len}) and {right_name} ({right_len}) should be equal"
        )));
    }
    Ok(())
}

/// Checks `0 < value <= 1`.
pub fn check_fraction(value: f64, name: &str) -> Result<()> {
    if !value.is_finite() {
        return Err(PhenoplierError::InvalidInput(format!(
            "Value of {name} should be finite"
        )));
    }
    if value <= 0.0 || value > 1.0 {
        return Err(PhenoplierError::InvalidInput(format!(
            "Value of {name} should be in (0, 1], got {value}"
        )));
    }
    Ok(())
}

pub fn check_positive(value: f64, name: &str) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(PhenoplierError::InvalidInput(format!(
            "Value of {name} should be a positive number, got {value}"
        )));
    }
    Ok(())
}

pub fn check_dir_exists(path: &Path, name: &str) -> Result<()> {
    if !path.is_dir() {
        return Err(PhenoplierError::Resource(format!(
            "Directory {} passed to {name} does not exist",
            path.display()
        )));
    }
    Ok(())
}

pub fn check_chromosome(chromosome: u8) -> Result<()> {
    if !(1..=22).contains(&chromosome) {
        return Err(PhenoplierError::InvalidInput(format!(
            "Chromosome number must be between 1 and 22, got {chromosome}"
        )));
    }
    Ok(())
}
