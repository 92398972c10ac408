//! Two-party Beaver triple generation over secp256k1
//!
//! Each party runs a `TriplesParty`. Both emit the same ten messages in the
//! same order, one per round:
//!
//! | index | message |
//! |---|---|
//! | 0, 4 | `Commit` to `(A_i, B_i)` of triple 0 / 1 |
//! | 1, 5 | `Reveal` of `(A_i, B_i, nonce)` |
//! | 2, 6 | `BShare`, the party's `b_i` |
//! | 3, 7 | `CShare`, the party's `C_i = c_i·G` |
//! | 8 | `Transcript` hash over the public view |
//! | 9 | `Confirm` participants and threshold |
//!
//! `b_i` travels in the clear, which stands in for the oblivious-transfer
//! multiplication of a production engine. Every received value is checked:
//! reveals against commitments, `b_i·G` against `B_i`, `C_i` against
//! `b·A_i`, and finally the transcript hashes against each other.

use k256::{ProjectivePoint, Scalar};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::secp::{decode_point, decode_scalar, encode_point, encode_scalar, random_scalar};
use super::CryptoError;

pub const TRIPLE_COUNT: usize = 2;
pub const MESSAGE_COUNT: usize = 10;
pub const TRIPLES_THRESHOLD: u16 = 2;

/// Public part of one triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriplePublic {
    pub big_a: String,
    pub big_b: String,
    pub big_c: String,
}

/// `pub_v`: what both parties must agree on before the triples are usable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriplesPublic {
    pub triples: Vec<TriplePublic>,
    pub participants: Vec<u32>,
    pub threshold: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriplesMessage {
    Commit { triple: u8, commitment: String },
    Reveal { triple: u8, big_a: String, big_b: String, nonce: String },
    BShare { triple: u8, b: String },
    CShare { triple: u8, big_c: String },
    Transcript { hash: String },
    Confirm { participants: Vec<u32>, threshold: u16 },
    PublicView { public: TriplesPublic },
}

/// One party's shares of one triple
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripleShare {
    pub a: String,
    pub b: String,
    pub c: String,
    pub public: TriplePublic,
}

/// Persisted result of a completed triples stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriplesOutput {
    pub party: u32,
    pub triples: Vec<TripleShare>,
    pub public: TriplesPublic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TripleWork {
    a: String,
    b: String,
    nonce: String,
    peer_commitment: Option<String>,
    peer_big_a: Option<String>,
    peer_big_b: Option<String>,
    peer_b: Option<String>,
    c: Option<String>,
    peer_big_c: Option<String>,
}

/// Per-party protocol state, serialized into the stage between rounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriplesParty {
    party: u32,
    peer: u32,
    triples: Vec<TripleWork>,
    peer_transcript: Option<String>,
    peer_confirmed: bool,
}

fn commitment_hash(party: u32, triple: u8, big_a: &str, big_b: &str, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"tss-triples-commit-v1");
    hasher.update(party.to_be_bytes());
    hasher.update([triple]);
    hasher.update(big_a.as_bytes());
    hasher.update(big_b.as_bytes());
    hasher.update(nonce.as_bytes());
    hex::encode(hasher.finalize())
}

fn mismatch(what: &str) -> CryptoError {
    CryptoError::CommitmentMismatch(what.to_string())
}

fn missing(what: &str) -> CryptoError {
    CryptoError::InvalidMessage(format!("{} not received yet", what))
}

impl TriplesParty {
    /// Fresh party with secrets for every triple
    pub fn new(party: u32, peer: u32) -> Self {
        let mut rng = rand::thread_rng();
        let triples = (0..TRIPLE_COUNT)
            .map(|_| {
                let mut nonce = [0u8; 32];
                rng.fill_bytes(&mut nonce);
                TripleWork {
                    a: encode_scalar(&random_scalar(&mut rng)),
                    b: encode_scalar(&random_scalar(&mut rng)),
                    nonce: hex::encode(nonce),
                    peer_commitment: None,
                    peer_big_a: None,
                    peer_big_b: None,
                    peer_b: None,
                    c: None,
                    peer_big_c: None,
                }
            })
            .collect();

        Self {
            party,
            peer,
            triples,
            peer_transcript: None,
            peer_confirmed: false,
        }
    }

    pub fn party(&self) -> u32 {
        self.party
    }

    fn participants(&self) -> Vec<u32> {
        let mut participants = vec![self.party, self.peer];
        participants.sort_unstable();
        participants
    }

    fn work(&self, triple: u8) -> Result<&TripleWork, CryptoError> {
        self.triples
            .get(usize::from(triple))
            .ok_or_else(|| CryptoError::InvalidMessage(format!("no triple {}", triple)))
    }

    fn work_mut(&mut self, triple: u8) -> Result<&mut TripleWork, CryptoError> {
        self.triples
            .get_mut(usize::from(triple))
            .ok_or_else(|| CryptoError::InvalidMessage(format!("no triple {}", triple)))
    }

    fn own_points(work: &TripleWork) -> Result<(ProjectivePoint, ProjectivePoint), CryptoError> {
        let a = decode_scalar(&work.a)?;
        let b = decode_scalar(&work.b)?;
        Ok((ProjectivePoint::GENERATOR * a, ProjectivePoint::GENERATOR * b))
    }

    /// Full `b` of a triple once the peer's share arrived
    fn full_b(work: &TripleWork) -> Result<Scalar, CryptoError> {
        let own = decode_scalar(&work.b)?;
        let peer = decode_scalar(work.peer_b.as_deref().ok_or_else(|| missing("peer b share"))?)?;
        Ok(own + peer)
    }

    /// Produce this party's message number `index` (0-based)
    pub fn emit(&mut self, index: usize) -> Result<TriplesMessage, CryptoError> {
        if index >= MESSAGE_COUNT {
            return Err(CryptoError::InvalidMessage(format!("no message {}", index)));
        }
        if index == 8 {
            let public = self.public_view()?;
            return Ok(TriplesMessage::Transcript {
                hash: transcript_hash(&public),
            });
        }
        if index == 9 {
            return Ok(TriplesMessage::Confirm {
                participants: self.participants(),
                threshold: TRIPLES_THRESHOLD,
            });
        }

        let triple = (index / 4) as u8;
        let party = self.party;
        match index % 4 {
            0 => {
                let work = self.work(triple)?;
                let (big_a, big_b) = Self::own_points(work)?;
                Ok(TriplesMessage::Commit {
                    triple,
                    commitment: commitment_hash(
                        party,
                        triple,
                        &encode_point(&big_a),
                        &encode_point(&big_b),
                        &work.nonce,
                    ),
                })
            }
            1 => {
                let work = self.work(triple)?;
                if work.peer_commitment.is_none() {
                    return Err(missing("peer commitment"));
                }
                let (big_a, big_b) = Self::own_points(work)?;
                Ok(TriplesMessage::Reveal {
                    triple,
                    big_a: encode_point(&big_a),
                    big_b: encode_point(&big_b),
                    nonce: work.nonce.clone(),
                })
            }
            2 => {
                let work = self.work(triple)?;
                if work.peer_big_b.is_none() {
                    return Err(missing("peer reveal"));
                }
                Ok(TriplesMessage::BShare {
                    triple,
                    b: work.b.clone(),
                })
            }
            _ => {
                let work = self.work_mut(triple)?;
                let b = Self::full_b(work)?;
                let c = decode_scalar(&work.a)? * b;
                work.c = Some(encode_scalar(&c));
                Ok(TriplesMessage::CShare {
                    triple,
                    big_c: encode_point(&(ProjectivePoint::GENERATOR * c)),
                })
            }
        }
    }

    /// Consume the peer's message number `index` (0-based)
    pub fn receive(&mut self, index: usize, message: &TriplesMessage) -> Result<(), CryptoError> {
        let expected_triple = (index / 4) as u8;
        let peer = self.peer;

        match (index, message) {
            (0 | 4, TriplesMessage::Commit { triple, commitment }) if *triple == expected_triple => {
                self.work_mut(*triple)?.peer_commitment = Some(commitment.clone());
                Ok(())
            }
            (1 | 5, TriplesMessage::Reveal { triple, big_a, big_b, nonce }) if *triple == expected_triple => {
                let work = self.work_mut(*triple)?;
                let committed = work.peer_commitment.as_deref().ok_or_else(|| missing("peer commitment"))?;
                if commitment_hash(peer, *triple, big_a, big_b, nonce) != committed {
                    return Err(mismatch("reveal does not match commitment"));
                }
                decode_point(big_a)?;
                decode_point(big_b)?;
                work.peer_big_a = Some(big_a.clone());
                work.peer_big_b = Some(big_b.clone());
                Ok(())
            }
            (2 | 6, TriplesMessage::BShare { triple, b }) if *triple == expected_triple => {
                let work = self.work_mut(*triple)?;
                let peer_big_b = decode_point(work.peer_big_b.as_deref().ok_or_else(|| missing("peer reveal"))?)?;
                if ProjectivePoint::GENERATOR * decode_scalar(b)? != peer_big_b {
                    return Err(mismatch("b share does not match revealed B"));
                }
                work.peer_b = Some(b.clone());
                Ok(())
            }
            (3 | 7, TriplesMessage::CShare { triple, big_c }) if *triple == expected_triple => {
                let work = self.work_mut(*triple)?;
                let b = Self::full_b(work)?;
                let peer_big_a = decode_point(work.peer_big_a.as_deref().ok_or_else(|| missing("peer reveal"))?)?;
                if peer_big_a * b != decode_point(big_c)? {
                    return Err(mismatch("peer product check failed"));
                }
                work.peer_big_c = Some(big_c.clone());
                Ok(())
            }
            (8, TriplesMessage::Transcript { hash }) => {
                let own = transcript_hash(&self.public_view()?);
                if &own != hash {
                    return Err(mismatch("transcript hash differs"));
                }
                self.peer_transcript = Some(hash.clone());
                Ok(())
            }
            (9, TriplesMessage::Confirm { participants, threshold }) => {
                if *participants != self.participants() || *threshold != TRIPLES_THRESHOLD {
                    return Err(mismatch("participants or threshold differ"));
                }
                self.peer_confirmed = true;
                Ok(())
            }
            _ => Err(CryptoError::InvalidMessage(format!(
                "unexpected message for round {}",
                index + 1
            ))),
        }
    }

    /// Recompute `pub_v` from local state
    pub fn public_view(&self) -> Result<TriplesPublic, CryptoError> {
        let triples = self
            .triples
            .iter()
            .map(|work| {
                let (own_a, own_b) = Self::own_points(work)?;
                let peer_a = decode_point(work.peer_big_a.as_deref().ok_or_else(|| missing("peer reveal"))?)?;
                let peer_b = decode_point(work.peer_big_b.as_deref().ok_or_else(|| missing("peer reveal"))?)?;
                let own_c = ProjectivePoint::GENERATOR
                    * decode_scalar(work.c.as_deref().ok_or_else(|| missing("own c share"))?)?;
                let peer_c = decode_point(work.peer_big_c.as_deref().ok_or_else(|| missing("peer C share"))?)?;
                Ok(TriplePublic {
                    big_a: encode_point(&(own_a + peer_a)),
                    big_b: encode_point(&(own_b + peer_b)),
                    big_c: encode_point(&(own_c + peer_c)),
                })
            })
            .collect::<Result<Vec<_>, CryptoError>>()?;

        Ok(TriplesPublic {
            triples,
            participants: self.participants(),
            threshold: TRIPLES_THRESHOLD,
        })
    }

    /// Final shares; only valid after the transcript exchange
    pub fn output(&self) -> Result<TriplesOutput, CryptoError> {
        if self.peer_transcript.is_none() {
            return Err(missing("peer transcript"));
        }
        let public = self.public_view()?;
        let triples = self
            .triples
            .iter()
            .zip(public.triples.iter())
            .map(|(work, public)| {
                Ok(TripleShare {
                    a: work.a.clone(),
                    b: work.b.clone(),
                    c: work.c.clone().ok_or_else(|| missing("own c share"))?,
                    public: public.clone(),
                })
            })
            .collect::<Result<Vec<_>, CryptoError>>()?;

        Ok(TriplesOutput {
            party: self.party,
            triples,
            public,
        })
    }
}

pub fn transcript_hash(public: &TriplesPublic) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"tss-triples-transcript-v1");
    for triple in &public.triples {
        hasher.update(triple.big_a.as_bytes());
        hasher.update(triple.big_b.as_bytes());
        hasher.update(triple.big_c.as_bytes());
    }
    for participant in &public.participants {
        hasher.update(participant.to_be_bytes());
    }
    hasher.update(public.threshold.to_be_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_to_transcript() -> (TriplesParty, TriplesParty) {
        let mut server = TriplesParty::new(0, 1);
        let mut client = TriplesParty::new(1, 0);
        for index in 0..MESSAGE_COUNT {
            let from_server = server.emit(index).unwrap();
            client.receive(index, &from_server).unwrap();
            let from_client = client.emit(index).unwrap();
            server.receive(index, &from_client).unwrap();
        }
        (server, client)
    }

    #[test]
    fn test_parties_agree_and_triples_multiply() {
        let (server, client) = run_to_transcript();
        assert_eq!(server.public_view().unwrap(), client.public_view().unwrap());

        let s = server.output().unwrap();
        let c = client.output().unwrap();
        for (ts, tc) in s.triples.iter().zip(c.triples.iter()) {
            let a = decode_scalar(&ts.a).unwrap() + decode_scalar(&tc.a).unwrap();
            let b = decode_scalar(&ts.b).unwrap() + decode_scalar(&tc.b).unwrap();
            let c_sum = decode_scalar(&ts.c).unwrap() + decode_scalar(&tc.c).unwrap();
            assert_eq!(a * b, c_sum);
            assert_eq!(encode_point(&(ProjectivePoint::GENERATOR * c_sum)), ts.public.big_c);
        }
    }

    #[test]
    fn test_tampered_reveal_rejected() {
        let mut server = TriplesParty::new(0, 1);
        let mut client = TriplesParty::new(1, 0);
        client.receive(0, &server.emit(0).unwrap()).unwrap();
        server.receive(0, &client.emit(0).unwrap()).unwrap();
        client.receive(1, &server.emit(1).unwrap()).unwrap();

        let mut reveal = client.emit(1).unwrap();
        if let TriplesMessage::Reveal { nonce, .. } = &mut reveal {
            *nonce = hex::encode([9u8; 32]);
        }
        assert!(matches!(
            server.receive(1, &reveal),
            Err(CryptoError::CommitmentMismatch(_))
        ));
    }

    #[test]
    fn test_out_of_order_message_rejected() {
        let mut server = TriplesParty::new(0, 1);
        let msg = TriplesMessage::BShare {
            triple: 0,
            b: hex::encode([1u8; 32]),
        };
        assert!(matches!(server.receive(0, &msg), Err(CryptoError::InvalidMessage(_))));
    }

    #[test]
    fn test_output_requires_transcript() {
        let server = TriplesParty::new(0, 1);
        assert!(server.output().is_err());
    }
}
