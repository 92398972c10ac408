//! Shamir sharing over any prime field
//!
//! Used with `k256::Scalar` for secp256k1 shares and
//! `curve25519_dalek::Scalar` for FROST signing shares.

use ff::PrimeField;
use rand::{CryptoRng, RngCore};

use super::CryptoError;

pub fn from_bytes<F: PrimeField>(bytes: &[u8; 32]) -> Result<F, CryptoError> {
    let mut repr = F::Repr::default();
    if repr.as_ref().len() != 32 {
        return Err(CryptoError::InvalidScalar("field repr is not 32 bytes".to_string()));
    }
    repr.as_mut().copy_from_slice(bytes);
    Option::from(F::from_repr(repr))
        .ok_or_else(|| CryptoError::InvalidScalar("value is not a canonical scalar".to_string()))
}

pub fn to_bytes<F: PrimeField>(value: &F) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(value.to_repr().as_ref());
    out
}

fn check_xs<F: PrimeField>(xs: &[F]) -> Result<(), CryptoError> {
    for (i, x) in xs.iter().enumerate() {
        if bool::from(x.is_zero()) {
            return Err(CryptoError::Threshold("x-coordinate must be non-zero".to_string()));
        }
        if xs[..i].contains(x) {
            return Err(CryptoError::Threshold("duplicate x-coordinate".to_string()));
        }
    }
    Ok(())
}

/// Evaluate a random degree `threshold - 1` polynomial with constant term
/// `secret` at every x
pub fn split<F: PrimeField, R: RngCore + CryptoRng>(
    secret: F,
    xs: &[F],
    threshold: usize,
    rng: &mut R,
) -> Result<Vec<F>, CryptoError> {
    if threshold < 2 {
        return Err(CryptoError::Threshold("threshold must be at least 2".to_string()));
    }
    if threshold > xs.len() {
        return Err(CryptoError::Threshold(format!(
            "threshold {} exceeds {} shares",
            threshold,
            xs.len()
        )));
    }
    check_xs(xs)?;

    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(secret);
    for _ in 1..threshold {
        coefficients.push(F::random(&mut *rng));
    }

    Ok(xs
        .iter()
        .map(|x| {
            // Horner
            coefficients
                .iter()
                .rev()
                .fold(F::ZERO, |acc, coefficient| acc * x + coefficient)
        })
        .collect())
}

/// Lagrange basis coefficient of `x_i` over `xs`, evaluated at `at`
pub fn lagrange_coefficient<F: PrimeField>(x_i: &F, xs: &[F], at: &F) -> Result<F, CryptoError> {
    let mut numerator = F::ONE;
    let mut denominator = F::ONE;
    for x_j in xs.iter().filter(|x_j| *x_j != x_i) {
        numerator *= *at - x_j;
        denominator *= *x_i - x_j;
    }
    let inverse: Option<F> = denominator.invert().into();
    inverse
        .map(|inv| numerator * inv)
        .ok_or_else(|| CryptoError::Threshold("degenerate x-coordinates".to_string()))
}

/// Evaluate the polynomial through `points` at `at`
pub fn interpolate<F: PrimeField>(points: &[(F, F)], at: &F) -> Result<F, CryptoError> {
    let xs: Vec<F> = points.iter().map(|(x, _)| *x).collect();
    check_xs(&xs)?;

    let mut acc = F::ZERO;
    for (x_i, y_i) in points {
        acc += *y_i * lagrange_coefficient(x_i, &xs, at)?;
    }
    Ok(acc)
}

/// Recover the secret from the first `threshold` points. Every further point
/// must lie on the same polynomial.
pub fn combine<F: PrimeField>(points: &[(F, F)], threshold: usize) -> Result<F, CryptoError> {
    if threshold < 2 {
        return Err(CryptoError::Threshold("threshold must be at least 2".to_string()));
    }
    if points.len() < threshold {
        return Err(CryptoError::Threshold(format!(
            "need {} shares, got {}",
            threshold,
            points.len()
        )));
    }
    let xs: Vec<F> = points.iter().map(|(x, _)| *x).collect();
    check_xs(&xs)?;

    let (basis, extra) = points.split_at(threshold);
    for (i, (x, y)) in extra.iter().enumerate() {
        if interpolate(basis, x)? != *y {
            return Err(CryptoError::InconsistentShares(format!(
                "share {} is off the polynomial of the first {}",
                threshold + i,
                threshold
            )));
        }
    }
    interpolate(basis, &F::ZERO)
}

/// Evaluate the existing polynomial at new x-coordinates; existing points
/// are left untouched. Returns the new y values and the recovered secret.
pub fn expand<F: PrimeField>(
    existing: &[(F, F)],
    new_xs: &[F],
    threshold: usize,
) -> Result<(Vec<F>, F), CryptoError> {
    let secret = combine(existing, threshold)?;

    let mut all_xs: Vec<F> = existing.iter().map(|(x, _)| *x).collect();
    all_xs.extend_from_slice(new_xs);
    check_xs(&all_xs)?;

    let basis = &existing[..threshold];
    let ys = new_xs
        .iter()
        .map(|x| interpolate(basis, x))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((ys, secret))
}
