//! Shamir sharing of a user's key fragment across key-share nodes
//!
//! Two share shapes are supported:
//! - secp256k1 `(x, y)` points, `x = sha256(node.name)` with the top bit cleared
//! - FROST `{identifier, signing_share}` pairs, `identifier = Identifier::derive(node.name)`
//!
//! Field arithmetic lives in the `CryptoEngine`; this module picks
//! coordinates, validates node sets and keeps shares attached to their nodes.

use std::collections::HashSet;
use std::sync::Arc;

use crate::crypto::{CryptoEngine, RawPoint};
use crate::error::{Result, TssError};
use crate::types::{CurveType, KeyShareNodeMeta, SharePoint, TeddsaKeyShare, UserKeySharePoint, UserTeddsaKeyShare};

/// Lowest threshold accepted anywhere
pub const MIN_THRESHOLD: u16 = 2;

/// Result of `expand_shares`: one share per node, existing ones unchanged
#[derive(Debug, Clone)]
pub struct ExpandedShares<S> {
    pub reshared: Vec<S>,
    pub original_secret: [u8; 32],
}

/// A FROST signing share rebuilt from node shares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredTeddsaShare {
    pub signing_share: [u8; 32],
    /// `signing_share·G`, recomputed locally
    pub verifying_share: [u8; 32],
}

#[derive(Clone)]
pub struct SecretSharingEngine {
    engine: Arc<dyn CryptoEngine>,
}

impl SecretSharingEngine {
    pub fn new(engine: Arc<dyn CryptoEngine>) -> Self {
        Self { engine }
    }

    // =========================================================================
    // secp256k1 points
    // =========================================================================

    pub fn split(
        &self,
        raw_share: &[u8; 32],
        nodes: &[KeyShareNodeMeta],
        threshold: u16,
    ) -> Result<Vec<UserKeySharePoint>> {
        check_threshold(threshold, nodes.len())?;
        let xs = self.node_xs(CurveType::Secp256k1, nodes)?;
        let ys = self
            .engine
            .sss_split(CurveType::Secp256k1, raw_share, &xs, usize::from(threshold))?;

        Ok(nodes
            .iter()
            .zip(xs.into_iter().zip(ys))
            .map(|(node, (x, y))| UserKeySharePoint {
                node: node.clone(),
                share: SharePoint { x, y },
            })
            .collect())
    }

    pub fn combine(&self, points: &[UserKeySharePoint], threshold: u16) -> Result<[u8; 32]> {
        check_threshold(threshold, points.len())?;
        let raw: Vec<RawPoint> = points.iter().map(|p| (p.share.x, p.share.y)).collect();
        Ok(self
            .engine
            .sss_combine(CurveType::Secp256k1, &raw, usize::from(threshold))?)
    }

    /// Evaluate the polynomial behind `existing` at the additional nodes' x
    pub fn expand_shares(
        &self,
        existing: &[UserKeySharePoint],
        additional: &[KeyShareNodeMeta],
        threshold: u16,
    ) -> Result<ExpandedShares<UserKeySharePoint>> {
        check_threshold(threshold, existing.len())?;
        self.check_distinct(existing.iter().map(|p| &p.node).chain(additional))?;

        let raw: Vec<RawPoint> = existing.iter().map(|p| (p.share.x, p.share.y)).collect();
        let new_xs = self.node_xs(CurveType::Secp256k1, additional)?;
        let (ys, original_secret) =
            self.engine
                .sss_expand(CurveType::Secp256k1, &raw, &new_xs, usize::from(threshold))?;

        let mut reshared = existing.to_vec();
        reshared.extend(additional.iter().zip(new_xs.into_iter().zip(ys)).map(|(node, (x, y))| {
            UserKeySharePoint {
                node: node.clone(),
                share: SharePoint { x, y },
            }
        }));

        Ok(ExpandedShares {
            reshared,
            original_secret,
        })
    }

    // =========================================================================
    // FROST signing shares
    // =========================================================================

    pub fn split_teddsa(
        &self,
        signing_share: &[u8; 32],
        nodes: &[KeyShareNodeMeta],
        threshold: u16,
    ) -> Result<Vec<UserTeddsaKeyShare>> {
        check_threshold(threshold, nodes.len())?;
        let identifiers = self.node_xs(CurveType::Ed25519, nodes)?;
        let shares = self
            .engine
            .sss_split(CurveType::Ed25519, signing_share, &identifiers, usize::from(threshold))?;

        Ok(nodes
            .iter()
            .zip(identifiers.into_iter().zip(shares))
            .map(|(node, (identifier, signing_share))| UserTeddsaKeyShare {
                node: node.clone(),
                share: TeddsaKeyShare {
                    identifier,
                    signing_share,
                },
            })
            .collect())
    }

    pub fn combine_teddsa(&self, shares: &[UserTeddsaKeyShare], threshold: u16) -> Result<RecoveredTeddsaShare> {
        check_threshold(threshold, shares.len())?;
        let raw: Vec<RawPoint> = shares
            .iter()
            .map(|s| (s.share.identifier, s.share.signing_share))
            .collect();
        let signing_share = self
            .engine
            .sss_combine(CurveType::Ed25519, &raw, usize::from(threshold))?;
        self.recovered(signing_share)
    }

    pub fn expand_teddsa_shares(
        &self,
        existing: &[UserTeddsaKeyShare],
        additional: &[KeyShareNodeMeta],
        threshold: u16,
    ) -> Result<ExpandedShares<UserTeddsaKeyShare>> {
        check_threshold(threshold, existing.len())?;
        self.check_distinct(existing.iter().map(|s| &s.node).chain(additional))?;

        let raw: Vec<RawPoint> = existing
            .iter()
            .map(|s| (s.share.identifier, s.share.signing_share))
            .collect();
        let identifiers = self.node_xs(CurveType::Ed25519, additional)?;
        let (shares, original_secret) =
            self.engine
                .sss_expand(CurveType::Ed25519, &raw, &identifiers, usize::from(threshold))?;

        let mut reshared = existing.to_vec();
        reshared.extend(additional.iter().zip(identifiers.into_iter().zip(shares)).map(
            |(node, (identifier, signing_share))| UserTeddsaKeyShare {
                node: node.clone(),
                share: TeddsaKeyShare {
                    identifier,
                    signing_share,
                },
            },
        ));

        Ok(ExpandedShares {
            reshared,
            original_secret,
        })
    }

    /// Rebuild the verifying share of a recovered signing share
    pub fn recovered(&self, signing_share: [u8; 32]) -> Result<RecoveredTeddsaShare> {
        let point = self.engine.scalar_base_mult(CurveType::Ed25519, &signing_share)?;
        let verifying_share: [u8; 32] = point
            .try_into()
            .map_err(|_| TssError::unknown("ed25519 point is not 32 bytes"))?;
        Ok(RecoveredTeddsaShare {
            signing_share,
            verifying_share,
        })
    }

    /// x-coordinate for `node` on `curve`
    pub fn node_x(&self, curve: CurveType, node: &KeyShareNodeMeta) -> Result<[u8; 32]> {
        Ok(self.engine.share_x(curve, &node.name)?)
    }

    fn node_xs(&self, curve: CurveType, nodes: &[KeyShareNodeMeta]) -> Result<Vec<[u8; 32]>> {
        self.check_distinct(nodes.iter())?;
        nodes.iter().map(|node| self.node_x(curve, node)).collect()
    }

    fn check_distinct<'a>(&self, nodes: impl Iterator<Item = &'a KeyShareNodeMeta>) -> Result<()> {
        let mut seen = HashSet::new();
        for node in nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(TssError::InvalidRequest(format!("duplicate node name: {}", node.name)));
            }
        }
        Ok(())
    }
}

fn check_threshold(threshold: u16, node_count: usize) -> Result<()> {
    if threshold < MIN_THRESHOLD {
        return Err(TssError::InvalidRequest(format!(
            "threshold {} is below {}",
            threshold, MIN_THRESHOLD
        )));
    }
    if usize::from(threshold) > node_count {
        return Err(TssError::KeyshareNodeInsufficient {
            required: usize::from(threshold),
            available: node_count,
        });
    }
    Ok(())
}
