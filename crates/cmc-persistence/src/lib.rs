//! ---
//! cmc_section: "03-persistence-logging"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Sealed state persistence for the coordinator."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Sealed state persistence.
//!
//! State is serialised into a versioned [`envelope`], encrypted by a [`Sealer`] and handed
//! to a [`StateStore`] as an opaque blob guarded by a revision number.

pub mod envelope;
pub mod sealer;
pub mod store;

pub use envelope::{decode_state, encode_state, EnvelopeError};
pub use sealer::{prepare_seal_dir, AesGcmSealer, SealError, Sealer};
pub use store::{LocalSealedStore, StateStore, StoreError, StoredBlob, SEALED_STATE_FILE};
