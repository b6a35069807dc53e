//! AES-256-GCM envelope encryption for record payloads.
//!
//! Every seal draws a fresh data key and nonce. The data key is wrapped under
//! the master key as `wrap_nonce(12) || ciphertext || tag(16)`, so rotating
//! the master key only touches the wrapped key, never the payload ciphertext.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};

use super::keys::{DataKey, KeyId, KeyRing, MasterKey, KEY_SIZE};
use crate::error::{Error, Result};
use crate::models::{Content, Payload, Record};
use crate::util::{base64_array, base64_bytes};

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Sealed payload as it crosses the remote boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload ciphertext with the GCM tag appended
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// Data key encrypted under the master key
    #[serde(with = "base64_bytes")]
    pub wrapped_data_key: Vec<u8>,
    /// Nonce used for the payload ciphertext
    #[serde(with = "base64_array")]
    pub nonce: [u8; NONCE_SIZE],
    /// Fingerprint of the master key that wrapped the data key
    pub key_id: KeyId,
}

/// Outcome of a rotation pass over a set of records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub rewrapped: usize,
    pub skipped: usize,
}

/// Encrypt `plaintext` under a fresh data key wrapped by `master`
pub fn seal(plaintext: &[u8], master: &MasterKey) -> Result<Envelope> {
    let data_key = DataKey::generate();
    let cipher = Aes256Gcm::new(data_key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let nonce_bytes: [u8; NONCE_SIZE] = nonce.into();

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("Payload encryption failed: {e}")))?;

    Ok(Envelope {
        ciphertext,
        wrapped_data_key: wrap_data_key(&data_key, master)?,
        nonce: nonce_bytes,
        key_id: master.id().clone(),
    })
}

/// Decrypt an envelope; any authentication failure is a [`Error::Decryption`]
pub fn open(envelope: &Envelope, master: &MasterKey) -> Result<Vec<u8>> {
    if &envelope.key_id != master.id() {
        return Err(Error::Decryption(format!(
            "envelope is wrapped by key {}, not {}",
            envelope.key_id,
            master.id()
        )));
    }

    let data_key = unwrap_data_key(&envelope.wrapped_data_key, master)?;
    let cipher = Aes256Gcm::new(data_key.as_bytes().into());
    cipher
        .decrypt(&Nonce::from(envelope.nonce), envelope.ciphertext.as_slice())
        .map_err(|_| Error::Decryption("payload authentication failed".to_string()))
}

/// Re-wrap the data key under `new`; ciphertext and nonce are unchanged
pub fn rewrap(envelope: &Envelope, old: &MasterKey, new: &MasterKey) -> Result<Envelope> {
    if &envelope.key_id != old.id() {
        return Err(Error::Decryption(format!(
            "envelope is wrapped by key {}, not {}",
            envelope.key_id,
            old.id()
        )));
    }

    let data_key = unwrap_data_key(&envelope.wrapped_data_key, old)?;
    Ok(Envelope {
        ciphertext: envelope.ciphertext.clone(),
        wrapped_data_key: wrap_data_key(&data_key, new)?,
        nonce: envelope.nonce,
        key_id: new.id().clone(),
    })
}

/// Replace a plaintext payload with its sealed form
pub fn seal_record(record: &Record, master: &MasterKey) -> Result<Record> {
    let payload = match &record.payload {
        Payload::Plain { content } => Payload::Sealed {
            envelope: seal(&content.to_bytes()?, master)?,
        },
        Payload::Sealed { .. } => record.payload.clone(),
    };
    Ok(Record {
        payload,
        ..record.clone()
    })
}

/// Replace a sealed payload with its plaintext, picking the key by `key_id`
pub fn open_record(record: &Record, ring: &KeyRing) -> Result<Record> {
    let payload = match &record.payload {
        Payload::Sealed { envelope } => {
            let key = ring.key_for(&envelope.key_id);
            let bytes = open(envelope, key).map_err(|error| match error {
                Error::Decryption(reason) => {
                    Error::Decryption(format!("record {}: {reason}", record.id))
                }
                other => other,
            })?;
            Payload::plain(Content::from_bytes(&bytes)?)
        }
        Payload::Plain { .. } => record.payload.clone(),
    };
    Ok(Record {
        payload,
        ..record.clone()
    })
}

/// Move every sealed record from `old` to `new`, persisting each one as it goes.
///
/// Records already wrapped by `new` are skipped, so a rotation interrupted by a
/// crash or a failed `persist` can simply be run again.
pub fn rotate_each<I, F>(
    old: &MasterKey,
    new: &MasterKey,
    records: I,
    mut persist: F,
) -> Result<RotationReport>
where
    I: IntoIterator<Item = Record>,
    F: FnMut(Record) -> Result<()>,
{
    let mut report = RotationReport::default();
    for record in records {
        let Payload::Sealed { envelope } = &record.payload else {
            report.skipped += 1;
            continue;
        };
        if &envelope.key_id == new.id() {
            report.skipped += 1;
            continue;
        }

        let envelope = rewrap(envelope, old, new)?;
        persist(Record {
            payload: Payload::Sealed { envelope },
            ..record
        })?;
        report.rewrapped += 1;
    }
    Ok(report)
}

/// Rewrap a batch of records in memory
pub fn rotate_master_key(
    old: &MasterKey,
    new: &MasterKey,
    records: Vec<Record>,
) -> Result<Vec<Record>> {
    let mut rotated = Vec::with_capacity(records.len());
    let mut pending = Vec::new();
    for record in records {
        match &record.payload {
            Payload::Sealed { envelope } if &envelope.key_id != new.id() => pending.push(record),
            _ => rotated.push(record),
        }
    }
    rotate_each(old, new, pending, |record| {
        rotated.push(record);
        Ok(())
    })?;
    Ok(rotated)
}

fn wrap_data_key(data_key: &DataKey, master: &MasterKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(master.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let nonce_bytes: [u8; NONCE_SIZE] = nonce.into();

    let wrapped = cipher
        .encrypt(&nonce, data_key.as_bytes().as_slice())
        .map_err(|e| Error::Crypto(format!("Data key wrapping failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + wrapped.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&wrapped);
    Ok(result)
}

fn unwrap_data_key(blob: &[u8], master: &MasterKey) -> Result<DataKey> {
    if blob.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
        return Err(Error::Decryption(format!(
            "wrapped data key has {} bytes",
            blob.len()
        )));
    }

    let nonce_bytes: [u8; NONCE_SIZE] = blob[..NONCE_SIZE]
        .try_into()
        .map_err(|_| Error::Decryption("invalid wrap nonce".to_string()))?;
    let cipher = Aes256Gcm::new(master.as_bytes().into());
    let mut plain = cipher
        .decrypt(&Nonce::from(nonce_bytes), &blob[NONCE_SIZE..])
        .map_err(|_| Error::Decryption("data key authentication failed".to_string()))?;

    let bytes: Result<[u8; KEY_SIZE]> = plain
        .as_slice()
        .try_into()
        .map_err(|_| Error::Decryption("unwrapped data key has the wrong size".to_string()));
    zeroize::Zeroize::zeroize(&mut plain);
    Ok(DataKey::from_bytes(bytes?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceId, OwnerId, RecordKind};
    use crate::util::now_millis;
    use pretty_assertions::assert_eq;

    fn sealed_note(title: &str, key: &MasterKey) -> Record {
        let record = Record::create(
            RecordKind::Note,
            OwnerId::new("acct").unwrap(),
            Content::new(title, "secret body", now_millis()),
            None,
            [],
            DeviceId::new(),
        )
        .unwrap();
        seal_record(&record, key).unwrap()
    }

    #[test]
    fn seal_then_open_returns_plaintext() {
        let key = MasterKey::generate();
        let envelope = seal(b"hello envelope", &key).unwrap();
        assert_eq!(envelope.key_id, *key.id());
        assert_eq!(open(&envelope, &key).unwrap(), b"hello envelope");
    }

    #[test]
    fn seal_uses_fresh_nonce_and_data_key() {
        let key = MasterKey::generate();
        let a = seal(b"same", &key).unwrap();
        let b = seal(b"same", &key).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.wrapped_data_key, b.wrapped_data_key);
    }

    #[test]
    fn open_with_other_key_is_decryption_error() {
        let envelope = seal(b"payload", &MasterKey::generate()).unwrap();
        let error = open(&envelope, &MasterKey::generate()).unwrap_err();
        assert!(matches!(error, Error::Decryption(_)));
    }

    #[test]
    fn forged_key_id_still_fails_authentication() {
        let other = MasterKey::generate();
        let mut envelope = seal(b"payload", &MasterKey::generate()).unwrap();
        envelope.key_id = other.id().clone();
        assert!(matches!(open(&envelope, &other), Err(Error::Decryption(_))));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = MasterKey::generate();
        let mut envelope = seal(b"payload", &key).unwrap();
        envelope.ciphertext[0] ^= 0xff;
        assert!(matches!(open(&envelope, &key), Err(Error::Decryption(_))));

        let mut envelope = seal(b"payload", &key).unwrap();
        let last = envelope.wrapped_data_key.len() - 1;
        envelope.wrapped_data_key[last] ^= 0x01;
        assert!(matches!(open(&envelope, &key), Err(Error::Decryption(_))));
    }

    #[test]
    fn rewrap_keeps_ciphertext() {
        let old = MasterKey::generate();
        let new = MasterKey::generate();
        let envelope = seal(b"rotate me", &old).unwrap();
        let rewrapped = rewrap(&envelope, &old, &new).unwrap();

        assert_eq!(rewrapped.ciphertext, envelope.ciphertext);
        assert_eq!(rewrapped.nonce, envelope.nonce);
        assert_eq!(open(&rewrapped, &new).unwrap(), b"rotate me");
        assert!(open(&rewrapped, &old).is_err());
    }

    #[test]
    fn envelope_serializes_binary_as_base64() {
        let envelope = seal(b"x", &MasterKey::generate()).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json["ciphertext"].is_string());
        assert!(json["nonce"].is_string());
        let parsed: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn record_roundtrips_through_seal_and_open() {
        let key = MasterKey::generate();
        let sealed = sealed_note("Diary", &key);
        assert!(sealed.payload.is_sealed());
        assert!(sealed.content().is_err());

        let opened = open_record(&sealed, &KeyRing::new(key)).unwrap();
        assert_eq!(opened.content().unwrap().title, "Diary");
        assert_eq!(opened.version, sealed.version);
    }

    #[test]
    fn rotate_master_key_rewraps_every_sealed_record() {
        let old = MasterKey::generate();
        let new = MasterKey::generate();
        let records = vec![sealed_note("a", &old), sealed_note("b", &old)];

        let rotated = rotate_master_key(&old, &new, records).unwrap();
        let ring = KeyRing::new(new);
        for record in &rotated {
            assert!(open_record(record, &ring).is_ok());
        }
    }

    #[test]
    fn interrupted_rotation_leaves_each_record_under_one_key() {
        let old = MasterKey::generate();
        let new = MasterKey::generate();
        let mut stored: Vec<Record> = (0..4)
            .map(|i| sealed_note(&format!("n{i}"), &old))
            .collect();

        let mut written = 0;
        let result = rotate_each(&old, &new, stored.clone(), |record| {
            if written == 2 {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            written += 1;
            let slot = stored.iter_mut().find(|r| r.id == record.id).unwrap();
            *slot = record;
            Ok(())
        });
        assert!(result.is_err());

        for record in &stored {
            let Payload::Sealed { envelope } = &record.payload else {
                panic!("record lost its envelope");
            };
            let under_old = open(envelope, &old).is_ok();
            let under_new = open(envelope, &new).is_ok();
            assert!(under_old ^ under_new);
        }

        let report = rotate_each(&old, &new, stored.clone(), |record| {
            let slot = stored.iter_mut().find(|r| r.id == record.id).unwrap();
            *slot = record;
            Ok(())
        })
        .unwrap();
        assert_eq!(report, RotationReport { rewrapped: 2, skipped: 2 });
    }
}
