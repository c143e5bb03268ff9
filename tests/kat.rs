//! Known answer / wire-layout tests

use chrono::{TimeZone, Utc};
use cryptoshovel_envelope::wire::{
    self, AEAD_TAG_BYTES, BARE_MESSAGE_MIN_BYTES, FINGERPRINT_BYTES, KEY_HEADER_BYTES,
    KEY_ID_BYTES, KEY_PAYLOAD_BYTES, KEY_TAG, MANAGED_MESSAGE_MIN_BYTES, NONCE_BYTES,
};
use cryptoshovel_envelope::{
    inspect, key_envelope, EnvelopeKind, KeyFormatError, KeyId, KeyRegistry, KeySecret,
    RegistryError, RsaIdentity, SymmetricKey, Validity,
};

const SECRET_B64: &str = "a9ITQAFpNi+wJqrw4n7SznGJ3rtACO1GoX8iYUHke+8=";

fn fixture(name: &str) -> String {
    std::fs::read_to_string(format!(
        "{}/tests/data/rsa-keys/{}.pem",
        env!("CARGO_MANIFEST_DIR"),
        name
    ))
    .unwrap()
}

#[test]
fn test_wire_constants() {
    assert_eq!(KEY_ID_BYTES, 8);
    assert_eq!(NONCE_BYTES, 16);
    assert_eq!(AEAD_TAG_BYTES, 16);
    assert_eq!(FINGERPRINT_BYTES, 16);
    assert_eq!(BARE_MESSAGE_MIN_BYTES, 32);
    assert_eq!(MANAGED_MESSAGE_MIN_BYTES, 41);
    assert_eq!(KEY_HEADER_BYTES, 19);
    assert_eq!(KEY_PAYLOAD_BYTES, 48);
}

#[test]
fn test_fingerprint_known_answer() {
    let public = RsaIdentity::from_public_pem(&fixture("receiver1.public")).unwrap();
    let private = RsaIdentity::from_private_pem(&fixture("receiver1.private")).unwrap();
    assert_eq!(public.fingerprint().to_hex(), "26783d714425ad21d83636aed8c1b4ce");
    assert_eq!(private.fingerprint(), public.fingerprint());
}

#[test]
fn test_fingerprint_hashes_pkcs1_public_key_der() {
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
    use sha2::{Digest, Sha256};

    let pem = fixture("receiver1.public");
    let key = rsa::RsaPublicKey::from_public_key_pem(pem.trim()).unwrap();
    let pkcs1 = Sha256::digest(key.to_pkcs1_der().unwrap().as_bytes());
    let spki = Sha256::digest(key.to_public_key_der().unwrap().as_bytes());

    let fingerprint = RsaIdentity::from_public_pem(&pem).unwrap().fingerprint();
    assert_eq!(fingerprint.as_bytes()[..], pkcs1[..FINGERPRINT_BYTES]);
    assert_ne!(fingerprint.as_bytes()[..], spki[..FINGERPRINT_BYTES]);
}

#[test]
fn test_export_known_answer() {
    let created = Utc.timestamp_millis_opt(1523697157207).unwrap();
    let key = SymmetricKey::import(&format!(r#"{{"k":"{}","c":1523697157207}}"#, SECRET_B64))
        .unwrap();
    assert_eq!(key.created_at(), created);
    assert_eq!(key.id(), None);
    assert_eq!(key.validity(), Validity::ALWAYS);

    let full = key
        .with_id(KeyId::from_base64("bUcmwfgbWhE=").unwrap())
        .with_validity(Validity::new(
            Some(Utc.timestamp_millis_opt(1523956965337).unwrap()),
            Some(Utc.timestamp_millis_opt(1524043365337).unwrap()),
        ));
    assert_eq!(
        full.export(),
        format!(
            r#"{{"i":"bUcmwfgbWhE=","k":"{}","a":1523956965337,"d":1524043365337,"c":1523697157207}}"#,
            SECRET_B64
        )
    );
}

#[test]
fn test_import_rejects_garbage() {
    assert!(matches!(
        SymmetricKey::import("not json"),
        Err(KeyFormatError::Json(_))
    ));
}

#[test]
fn test_registry_file_layout() {
    let created = Utc.timestamp_millis_opt(1523697157207).unwrap();
    let id = KeyId::from_base64("bUcmwfgbWhE=").unwrap();
    let secret = SymmetricKey::import(&format!(r#"{{"k":"{}","c":0}}"#, SECRET_B64))
        .unwrap()
        .secret()
        .clone();

    let mut registry = KeyRegistry::new();
    let key = SymmetricKey::from_secret(secret, created).with_id(id);
    registry.add(key.clone()).unwrap();
    registry.set_active(&key).unwrap();

    assert_eq!(
        registry.to_json().unwrap(),
        format!(
            r#"{{"l":["{{\"i\":\"bUcmwfgbWhE=\",\"k\":\"{}\",\"c\":1523697157207}}"],"e":"bUcmwfgbWhE="}}"#,
            SECRET_B64
        )
    );
    assert!(matches!(
        KeyRegistry::from_json(r#"{"l":["{}"]}"#),
        Err(RegistryError::Format(_))
    ));
}

#[test]
fn test_key_envelope_structure() {
    let sender = RsaIdentity::from_private_pem(&fixture("sender.private")).unwrap();
    let receiver = RsaIdentity::from_public_pem(&fixture("receiver1.public")).unwrap();
    let key = SymmetricKey::from_secret(KeySecret::from_bytes([7; 32]), Utc::now())
        .with_id(KeyId::from_bytes([1; 8]));

    let envelope = key_envelope::seal(&key, &receiver, &sender).unwrap();
    assert_eq!(envelope[0], KEY_TAG);
    assert_eq!(&envelope[1..17], receiver.fingerprint().as_bytes());

    let ct_len = u16::from_le_bytes([envelope[17], envelope[18]]) as usize;
    assert_eq!(ct_len, receiver.modulus_bytes());
    assert_eq!(envelope.len(), KEY_HEADER_BYTES + ct_len + sender.modulus_bytes());

    let parts = wire::decode_key_envelope(&envelope).unwrap();
    assert_eq!(parts.ciphertext.len(), ct_len);
    assert_eq!(
        inspect(&envelope),
        EnvelopeKind::Key {
            fingerprint: *receiver.fingerprint().as_bytes(),
            ciphertext_len: ct_len,
            signature_len: sender.modulus_bytes(),
        }
    );
}

#[test]
fn test_key_envelope_length_field_checked() {
    let mut data = vec![KEY_TAG];
    data.extend_from_slice(&[0u8; FINGERPRINT_BYTES]);
    data.extend_from_slice(&200u16.to_le_bytes());
    data.extend_from_slice(&[0u8; 100]);
    assert!(wire::decode_key_envelope(&data).is_err());

    // zero-length ciphertext
    let mut empty = vec![KEY_TAG];
    empty.extend_from_slice(&[0u8; FINGERPRINT_BYTES]);
    empty.extend_from_slice(&0u16.to_le_bytes());
    empty.extend_from_slice(&[1u8; 8]);
    assert!(wire::decode_key_envelope(&empty).is_err());
}

#[test]
fn test_unframed_inspection() {
    assert_eq!(inspect(b""), EnvelopeKind::Unframed { len: 0 });
    assert_eq!(inspect(b"M-short"), EnvelopeKind::Unframed { len: 7 });
}
