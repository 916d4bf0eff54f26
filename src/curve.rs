//! Thin wrappers over k256 group arithmetic
//!
//! The solver treats secp256k1 as a library primitive: point addition,
//! generator multiplication and SEC1 encoding all come from k256. Nothing in
//! this crate touches field arithmetic directly.

use anyhow::{anyhow, Result};
use k256::elliptic_curve::ops::MulByGenerator;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use num_bigint::BigUint;

use crate::types::{Dist, XCoord, DIST_BYTES, X_BYTES};

/// Affine x of a point in wire limb order. `None` for the identity.
pub fn x_coord(p: &ProjectivePoint) -> Option<XCoord> {
    let enc = p.to_affine().to_encoded_point(false);
    let x = enc.x()?;
    let mut buf = [0u8; X_BYTES];
    buf.copy_from_slice(x.as_slice());
    Some(XCoord::from_be_bytes(&buf))
}

/// Big-endian (x, y) pair for handshake serialization. `None` for the identity.
pub fn point_to_xy(p: &ProjectivePoint) -> Option<([u8; 32], [u8; 32])> {
    let enc = p.to_affine().to_encoded_point(false);
    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    x.copy_from_slice(enc.x()?.as_slice());
    y.copy_from_slice(enc.y()?.as_slice());
    Some((x, y))
}

/// Rebuild a point from big-endian affine coordinates, rejecting anything
/// off the curve.
pub fn point_from_xy(x: &[u8; 32], y: &[u8; 32]) -> Result<ProjectivePoint> {
    let enc = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(x),
        FieldBytes::from_slice(y),
        false,
    );
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&enc))
        .map(ProjectivePoint::from)
        .ok_or_else(|| anyhow!("affine coordinates are not a secp256k1 point"))
}

/// Parse a SEC1 public key (compressed 02/03 or uncompressed 04) from hex.
pub fn parse_pubkey(s: &str) -> Result<ProjectivePoint> {
    let bytes = hex::decode(s.trim()).map_err(|e| anyhow!("bad pubkey hex: {e}"))?;
    let enc = EncodedPoint::from_bytes(&bytes).map_err(|e| anyhow!("bad SEC1 encoding: {e}"))?;
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&enc))
        .map(ProjectivePoint::from)
        .ok_or_else(|| anyhow!("public key is not on secp256k1"))
}

/// Canonical scalar from 32 big-endian bytes. `None` when >= the group order.
pub fn scalar_from_be32(bytes: &[u8; 32]) -> Option<Scalar> {
    Option::from(Scalar::from_repr(FieldBytes::from(*bytes)))
}

pub fn scalar_to_be32(s: &Scalar) -> [u8; 32] {
    s.to_repr().into()
}

/// A 192-bit distance is always below the group order.
pub fn scalar_from_dist(d: &Dist) -> Scalar {
    let mut bytes = [0u8; 32];
    bytes[32 - DIST_BYTES..].copy_from_slice(&d.to_be_bytes());
    scalar_from_be32(&bytes).expect("192-bit value is a canonical scalar")
}

/// `None` when the value does not reduce to a canonical scalar.
pub fn scalar_from_biguint(v: &BigUint) -> Option<Scalar> {
    if v.bits() > 256 {
        return None;
    }
    let raw = v.to_bytes_be();
    let mut bytes = [0u8; 32];
    bytes[32 - raw.len()..].copy_from_slice(&raw);
    scalar_from_be32(&bytes)
}

pub fn mul_g(k: &Scalar) -> ProjectivePoint {
    ProjectivePoint::mul_by_generator(k)
}

/// Wild herd base point `P - wild_offset*G`.
pub fn wild_base(target: &ProjectivePoint, wild_offset: &Scalar) -> ProjectivePoint {
    *target - mul_g(wild_offset)
}
