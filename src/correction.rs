//! Focal-height correction surface.
//!
//! Wide-field and third-axis scan systems keep the focal spot on the work
//! plane by commanding a z value that depends on where in the field the beam
//! lands. The calibration software fits a polynomial to measured focus
//! offsets and hands the coefficients over; this module evaluates that fit.
//!
//! The fit is a polynomial in the beam path length `f` from the scanner pivot
//! to the commanded point,
//!
//! ```text
//! f = sqrt(x² + y² + (base_focal + height)²)
//! z = base_focal + k₀ + k₁·f + k₂·f² + ...
//! ```
//!
//! where `height` is the work plane's offset from the calibration plane. The
//! coefficient count sets the polynomial degree: however many coefficients
//! the calibrator produced, that many ascending-power terms are used.

use crate::Error;

/// A fitted focal-height correction: base focal value plus polynomial
/// coefficients in canonical (ascending power) order.
///
/// Immutable once constructed. Evaluation borrows `self`, so a surface can be
/// shared freely across threads once installed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CorrectionSurface {
    base_focal: f32,
    coeffs: Vec<f64>,
}

impl CorrectionSurface {
    /// Builds a surface from calibration output.
    ///
    /// At least one coefficient is required, and every value must be finite.
    pub fn new(base_focal: f32, coeffs: Vec<f64>) -> Result<Self, Error> {
        if coeffs.is_empty() {
            return Err(Error::InvalidArgument(
                "correction surface needs at least one coefficient".to_string(),
            ));
        }
        if !base_focal.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "base focal value {} is not finite",
                base_focal
            )));
        }
        if let Some(k) = coeffs.iter().find(|k| !k.is_finite()) {
            return Err(Error::InvalidArgument(format!(
                "correction coefficient {} is not finite",
                k
            )));
        }
        Ok(CorrectionSurface { base_focal, coeffs })
    }

    /// The no-correction surface: zero base focal, zero coefficients.
    pub fn identity() -> Self {
        CorrectionSurface::default()
    }

    pub fn base_focal(&self) -> f32 {
        self.base_focal
    }

    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    /// Computes the corrected focal height for a field position.
    ///
    /// `height` is the commanded z before correction, i.e. the work plane's
    /// offset from the calibration plane.
    pub fn evaluate(&self, x: f32, y: f32, height: f32) -> f32 {
        let x = f64::from(x);
        let y = f64::from(y);
        let reach = f64::from(self.base_focal) + f64::from(height);
        let f = (x * x + y * y + reach * reach).sqrt();

        let mut offset = 0.0;
        let mut term = 1.0;
        for k in &self.coeffs {
            offset += k * term;
            term *= f;
        }
        (f64::from(self.base_focal) + offset) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identity_evaluates_to_zero() {
        let s = CorrectionSurface::identity();
        assert_eq!(s.evaluate(0.0, 0.0, 0.0), 0.0);
        assert_eq!(s.evaluate(50.0, -30.0, 0.0), 0.0);
    }

    #[test]
    fn constant_term_only() {
        let s = CorrectionSurface::new(160.0, vec![2.5]).unwrap();
        // Position-independent: base + k0 everywhere.
        assert_relative_eq!(s.evaluate(0.0, 0.0, 0.0), 162.5);
        assert_relative_eq!(s.evaluate(40.0, -25.0, 3.0), 162.5);
    }

    #[test]
    fn linear_term_follows_path_length() {
        let s = CorrectionSurface::new(100.0, vec![0.0, 1.0]).unwrap();
        // At field center with zero height, path length equals base focal.
        assert_relative_eq!(s.evaluate(0.0, 0.0, 0.0), 200.0, epsilon = 1e-4);
        // 3-4-5 triangle in the field: sqrt(60² + 80² + 100²).
        let f = (60.0f64 * 60.0 + 80.0 * 80.0 + 100.0 * 100.0).sqrt();
        assert_relative_eq!(
            s.evaluate(60.0, 80.0, 0.0),
            (100.0 + f) as f32,
            epsilon = 1e-3
        );
    }

    #[test]
    fn height_extends_the_reach() {
        let s = CorrectionSurface::new(100.0, vec![0.0, 1.0]).unwrap();
        // Raising the work plane by 10 at field center lengthens the path
        // to 110.
        assert_relative_eq!(s.evaluate(0.0, 0.0, 10.0), 210.0, epsilon = 1e-4);
    }

    #[test]
    fn quadratic_fit_matches_manual_evaluation() {
        let (a, b, c) = (2.0e-4, -0.31, 118.0);
        let s = CorrectionSurface::new(538.0, vec![c, b, a]).unwrap();
        let (x, y, h) = (120.0f64, -45.0f64, 0.5f64);
        let reach = 538.0 + h;
        let f = (x * x + y * y + reach * reach).sqrt();
        let expected = 538.0 + a * f * f + b * f + c;
        assert_relative_eq!(
            s.evaluate(x as f32, y as f32, h as f32),
            expected as f32,
            epsilon = 1e-2
        );
    }

    #[test]
    fn rejects_bad_coefficients() {
        assert!(CorrectionSurface::new(100.0, vec![]).is_err());
        assert!(CorrectionSurface::new(f32::NAN, vec![1.0]).is_err());
        assert!(CorrectionSurface::new(100.0, vec![f64::INFINITY]).is_err());
    }
}
