use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{tree::Node, xpath::Context};
use openssl::{
    aes::{unwrap_key, wrap_key, AesKey},
    derive::Deriver,
    ec::EcKey,
    encrypt::{Decrypter, Encrypter},
    hash::MessageDigest,
    pkey::{HasPublic, Id, PKey, PKeyRef, Private},
    rand::rand_bytes,
    rsa::Padding,
    symm::{decrypt_aead, encrypt_aead},
    x509::X509,
};
use tracing::{debug, warn};

use super::{
    algorithm::{mgf1_digest, CONCAT_KDF, ELEMENT_TYPE, KEY_WRAP_AES256, MGF1_SHA256},
    certificate::certificate_to_base64,
    Credential, DataEncryptionAlgorithm, DigestAlgorithm, KeyAgreementAlgorithm,
    KeyTransportAlgorithm,
};
use crate::{
    error::{EngineError, EngineResult, ErrorKey},
    ns,
    utils::{
        decode_xml_base64, find_nodes, find_value, parse_document, strip_xml_declaration,
        xpath_context,
    },
};

const KEK_LEN: usize = 32;

/// Encrypts assertions for a peer and decrypts the ones addressed to us.
///
/// Recipients holding an RSA key get the content key by key transport,
/// recipients holding an EC key by ECDH-ES agreement and AES key wrap.
#[derive(Debug, Clone)]
pub struct ProtocolCipher {
    data_encryption: DataEncryptionAlgorithm,
    allowed_data_encryption: Vec<DataEncryptionAlgorithm>,
    key_transport: KeyTransportAlgorithm,
    key_agreement: KeyAgreementAlgorithm,
}

impl ProtocolCipher {
    pub fn new(
        data_encryption: DataEncryptionAlgorithm,
        allowed_data_encryption: Vec<DataEncryptionAlgorithm>,
        key_transport: KeyTransportAlgorithm,
        key_agreement: KeyAgreementAlgorithm,
    ) -> Self {
        Self {
            data_encryption,
            allowed_data_encryption,
            key_transport,
            key_agreement,
        }
    }

    /// Wraps `assertion_xml` in a `saml2:EncryptedAssertion` readable only by
    /// the holder of `recipient`'s private key.
    pub fn encrypt_assertion(
        &self,
        assertion_xml: &str,
        recipient: &X509,
        peer_protocol_versions: &[String],
    ) -> EngineResult<String> {
        let plain = strip_xml_declaration(assertion_xml);
        let mut content_key = vec![0; self.data_encryption.key_len()];
        rand_bytes(&mut content_key)?;
        let mut iv = [0; DataEncryptionAlgorithm::IV_LEN];
        rand_bytes(&mut iv)?;
        let mut tag = [0; DataEncryptionAlgorithm::TAG_LEN];
        let mut cipher_value = iv.to_vec();
        cipher_value.extend(encrypt_aead(
            self.data_encryption.cipher(),
            &content_key,
            Some(&iv),
            &[],
            plain.as_bytes(),
            &mut tag,
        )?);
        cipher_value.extend_from_slice(&tag);

        let recipient_key = recipient.public_key()?;
        let encrypted_key = if recipient_key.id() == Id::EC {
            self.agree_and_wrap(&content_key, recipient, &recipient_key)?
        } else {
            let transport = KeyTransportAlgorithm::for_peer(self.key_transport, peer_protocol_versions);
            if transport != self.key_transport {
                debug!(algorithm = transport.uri(), "peer predates xmlenc 1.1, using legacy key transport");
            }
            transport_key(&content_key, recipient, &recipient_key, transport)?
        };

        Ok(format!(
            concat!(
                "<saml2:EncryptedAssertion xmlns:saml2=\"{saml2}\" xmlns:xenc=\"{xenc}\" ",
                "xmlns:xenc11=\"{xenc11}\" xmlns:ds=\"{ds}\" xmlns:dsig11=\"{dsig11}\">",
                "<xenc:EncryptedData Type=\"{element}\">",
                "<xenc:EncryptionMethod Algorithm=\"{data_alg}\"/>",
                "<ds:KeyInfo>{encrypted_key}</ds:KeyInfo>",
                "<xenc:CipherData><xenc:CipherValue>{value}</xenc:CipherValue></xenc:CipherData>",
                "</xenc:EncryptedData>",
                "</saml2:EncryptedAssertion>"
            ),
            saml2 = ns::SAML2_ASSERTION,
            xenc = ns::XMLENC,
            xenc11 = ns::XMLENC11,
            ds = ns::XMLDSIG,
            dsig11 = ns::XMLDSIG11,
            element = ELEMENT_TYPE,
            data_alg = self.data_encryption.uri(),
            encrypted_key = encrypted_key,
            value = BASE64_STANDARD.encode(cipher_value),
        ))
    }

    /// Returns the assertion XML inside a `saml2:EncryptedAssertion`.
    pub fn decrypt_assertion(&self, encrypted_xml: &str, credential: &Credential) -> EngineResult<String> {
        let document = parse_document(encrypted_xml.as_bytes())?;
        let mut context = xpath_context(&document)?;

        let data_method = find_value(
            &mut context,
            "//xenc:EncryptedData/xenc:EncryptionMethod/@Algorithm",
            None,
        )
        .ok_or_else(|| decrypting("encrypted data has no encryption method"))?;
        let data_encryption = DataEncryptionAlgorithm::from_uri(&data_method)
            .filter(|alg| self.allowed_data_encryption.contains(alg))
            .ok_or_else(|| {
                warn!(algorithm = %data_method, "data encryption algorithm not allowed");
                EngineError::encryption(
                    ErrorKey::InvalidEncryptionAlgorithm,
                    format!("data encryption algorithm {data_method} is not allowed"),
                )
            })?;

        let encrypted_key = find_nodes(&mut context, "//xenc:EncryptedKey", None)
            .into_iter()
            .next()
            .ok_or_else(|| decrypting("no encrypted key"))?;
        let private_key = credential.private_key()?;
        let content_key = recover_key(&mut context, &encrypted_key, private_key)?;
        if content_key.len() != data_encryption.key_len() {
            return Err(decrypting("content key length does not fit the data encryption algorithm"));
        }

        let cipher_value = find_value(
            &mut context,
            "//xenc:EncryptedData/xenc:CipherData/xenc:CipherValue/text()",
            None,
        )
        .ok_or_else(|| decrypting("encrypted data has no cipher value"))?;
        let cipher_value = decode_xml_base64(&cipher_value)?;
        let (iv_len, tag_len) = (DataEncryptionAlgorithm::IV_LEN, DataEncryptionAlgorithm::TAG_LEN);
        if cipher_value.len() < iv_len + tag_len {
            return Err(decrypting("cipher value too short"));
        }
        let (iv, rest) = cipher_value.split_at(iv_len);
        let (data, tag) = rest.split_at(rest.len() - tag_len);
        let plain = decrypt_aead(data_encryption.cipher(), &content_key, Some(iv), &[], data, tag)
            .map_err(|_| decrypting("assertion does not decrypt with the content key"))?;
        String::from_utf8(plain).map_err(|_| decrypting("decrypted assertion is not UTF-8"))
    }

    fn agree_and_wrap<T: HasPublic>(
        &self,
        content_key: &[u8],
        recipient: &X509,
        recipient_key: &PKeyRef<T>,
    ) -> EngineResult<String> {
        let recipient_ec = recipient_key.ec_key()?;
        let ephemeral = PKey::from_ec_key(EcKey::generate(recipient_ec.group())?)?;
        let mut deriver = Deriver::new(&ephemeral)?;
        deriver.set_peer(recipient_key)?;
        let shared = deriver.derive_to_vec()?;
        let algorithm_id = algorithm_id();
        let kek = concat_kdf(&shared, &algorithm_id)?;
        let wrapped = aes_wrap(&kek, content_key)?;

        Ok(format!(
            concat!(
                "<xenc:EncryptedKey>",
                "<xenc:EncryptionMethod Algorithm=\"{kw}\"/>",
                "<ds:KeyInfo>",
                "<xenc:AgreementMethod Algorithm=\"{agreement}\">",
                "<xenc11:KeyDerivationMethod Algorithm=\"{kdf}\">",
                "<xenc11:ConcatKDFParams AlgorithmID=\"{algorithm_id}\" PartyUInfo=\"\" PartyVInfo=\"\">",
                "<ds:DigestMethod Algorithm=\"{digest}\"/>",
                "</xenc11:ConcatKDFParams>",
                "</xenc11:KeyDerivationMethod>",
                "<xenc:OriginatorKeyInfo><dsig11:DEREncodedKeyValue>{originator}</dsig11:DEREncodedKeyValue></xenc:OriginatorKeyInfo>",
                "<xenc:RecipientKeyInfo><ds:X509Data><ds:X509Certificate>{recipient}</ds:X509Certificate></ds:X509Data></xenc:RecipientKeyInfo>",
                "</xenc:AgreementMethod>",
                "</ds:KeyInfo>",
                "<xenc:CipherData><xenc:CipherValue>{value}</xenc:CipherValue></xenc:CipherData>",
                "</xenc:EncryptedKey>"
            ),
            kw = KEY_WRAP_AES256,
            agreement = self.key_agreement.uri(),
            kdf = CONCAT_KDF,
            algorithm_id = algorithm_id,
            digest = DigestAlgorithm::Sha256.uri(),
            originator = BASE64_STANDARD.encode(ephemeral.public_key_to_der()?),
            recipient = certificate_to_base64(recipient)?,
            value = BASE64_STANDARD.encode(wrapped),
        ))
    }
}

fn transport_key<T: HasPublic>(
    content_key: &[u8],
    recipient: &X509,
    recipient_key: &PKeyRef<T>,
    transport: KeyTransportAlgorithm,
) -> EngineResult<String> {
    let (oaep, mgf1) = transport.digests();
    let mut encrypter = Encrypter::new(recipient_key)?;
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    encrypter.set_rsa_oaep_md(oaep.message_digest())?;
    encrypter.set_rsa_mgf1_md(mgf1.message_digest())?;
    let mut encrypted = vec![0; encrypter.encrypt_len(content_key)?];
    let len = encrypter.encrypt(content_key, &mut encrypted)?;
    encrypted.truncate(len);

    let mgf = if transport.is_legacy() {
        String::new()
    } else {
        format!("<xenc11:MGF Algorithm=\"{MGF1_SHA256}\"/>")
    };
    Ok(format!(
        concat!(
            "<xenc:EncryptedKey>",
            "<xenc:EncryptionMethod Algorithm=\"{alg}\"><ds:DigestMethod Algorithm=\"{digest}\"/>{mgf}</xenc:EncryptionMethod>",
            "<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{recipient}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>",
            "<xenc:CipherData><xenc:CipherValue>{value}</xenc:CipherValue></xenc:CipherData>",
            "</xenc:EncryptedKey>"
        ),
        alg = transport.uri(),
        digest = oaep.uri(),
        mgf = mgf,
        recipient = certificate_to_base64(recipient)?,
        value = BASE64_STANDARD.encode(encrypted),
    ))
}

fn recover_key(context: &mut Context, encrypted_key: &Node, private_key: &PKey<Private>) -> EngineResult<Vec<u8>> {
    let method = find_value(context, "xenc:EncryptionMethod/@Algorithm", Some(encrypted_key))
        .ok_or_else(|| decrypting("encrypted key has no encryption method"))?;
    let wrapped = find_value(context, "xenc:CipherData/xenc:CipherValue/text()", Some(encrypted_key))
        .ok_or_else(|| decrypting("encrypted key has no cipher value"))?;
    let wrapped = decode_xml_base64(&wrapped)?;

    if let Some(transport) = KeyTransportAlgorithm::from_uri(&method) {
        // Absent DigestMethod and MGF both mean SHA-1 for either suite.
        let oaep = match find_value(context, "xenc:EncryptionMethod/ds:DigestMethod/@Algorithm", Some(encrypted_key)) {
            Some(uri) => DigestAlgorithm::from_uri(&uri).ok_or_else(|| {
                EngineError::encryption(
                    ErrorKey::InvalidEncryptionAlgorithm,
                    format!("OAEP digest {uri} is not supported"),
                )
            })?,
            None => DigestAlgorithm::Sha1,
        };
        let mgf1 = match find_value(context, "xenc:EncryptionMethod/xenc11:MGF/@Algorithm", Some(encrypted_key)) {
            None => MessageDigest::sha1(),
            Some(uri) if transport.is_legacy() => {
                return Err(EngineError::encryption(
                    ErrorKey::InvalidEncryptionAlgorithm,
                    format!("{} fixes MGF1 to SHA-1, got {uri}", transport.uri()),
                ))
            }
            Some(uri) => mgf1_digest(&uri).ok_or_else(|| {
                EngineError::encryption(
                    ErrorKey::InvalidEncryptionAlgorithm,
                    format!("mask generation function {uri} is not supported"),
                )
            })?,
        };
        if private_key.id() != Id::RSA {
            return Err(decrypting("key transport needs an RSA decryption key"));
        }
        let mut decrypter = Decrypter::new(private_key)?;
        decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
        decrypter.set_rsa_oaep_md(oaep.message_digest())?;
        decrypter.set_rsa_mgf1_md(mgf1)?;
        let mut key = vec![0; decrypter.decrypt_len(&wrapped)?];
        let len = decrypter
            .decrypt(&wrapped, &mut key)
            .map_err(|_| decrypting("content key does not decrypt with our key"))?;
        key.truncate(len);
        return Ok(key);
    }

    if method != KEY_WRAP_AES256 {
        return Err(EngineError::encryption(
            ErrorKey::InvalidEncryptionAlgorithm,
            format!("key encryption algorithm {method} is not supported"),
        ));
    }
    let agreement = find_value(context, "ds:KeyInfo/xenc:AgreementMethod/@Algorithm", Some(encrypted_key))
        .ok_or_else(|| decrypting("key wrap without agreement method"))?;
    if KeyAgreementAlgorithm::from_uri(&agreement).is_none() {
        return Err(EngineError::encryption(
            ErrorKey::InvalidEncryptionAlgorithm,
            format!("key agreement algorithm {agreement} is not supported"),
        ));
    }
    let algorithm_id = find_value(
        context,
        "ds:KeyInfo/xenc:AgreementMethod/xenc11:KeyDerivationMethod/xenc11:ConcatKDFParams/@AlgorithmID",
        Some(encrypted_key),
    )
    .unwrap_or_default();
    let originator = find_value(
        context,
        "ds:KeyInfo/xenc:AgreementMethod/xenc:OriginatorKeyInfo/*[local-name()='DEREncodedKeyValue']/text()",
        Some(encrypted_key),
    )
    .ok_or_else(|| decrypting("agreement method has no originator key"))?;
    let originator = PKey::public_key_from_der(&decode_xml_base64(&originator)?)?;
    if private_key.id() != Id::EC {
        return Err(decrypting("key agreement needs an EC decryption key"));
    }
    let mut deriver = Deriver::new(private_key)?;
    deriver.set_peer(&originator)?;
    let shared = deriver.derive_to_vec()?;
    let kek = concat_kdf(&shared, &algorithm_id)?;
    aes_unwrap(&kek, &wrapped)
}

/// `AlgorithmID` attribute: a zero padding byte then the key wrap URI, hex.
fn algorithm_id() -> String {
    format!("00{}", hex::encode(KEY_WRAP_AES256))
}

/// Single round ConcatKDF with SHA-256, which yields exactly one AES-256 key.
fn concat_kdf(shared_secret: &[u8], algorithm_id: &str) -> EngineResult<Vec<u8>> {
    let other_info = hex::decode(algorithm_id)
        .map_err(|_| decrypting("AlgorithmID is not hex"))?;
    let mut input = 1u32.to_be_bytes().to_vec();
    input.extend_from_slice(shared_secret);
    input.extend(other_info.into_iter().skip(1));
    let mut key = DigestAlgorithm::Sha256.digest(&input)?;
    key.truncate(KEK_LEN);
    Ok(key)
}

fn aes_wrap(kek: &[u8], key: &[u8]) -> EngineResult<Vec<u8>> {
    let kek = AesKey::new_encrypt(kek).map_err(|e| EngineError::Crypto(format!("{e:?}")))?;
    let mut wrapped = vec![0; key.len() + 8];
    let len = wrap_key(&kek, None, &mut wrapped, key).map_err(|e| EngineError::Crypto(format!("{e:?}")))?;
    wrapped.truncate(len);
    Ok(wrapped)
}

fn aes_unwrap(kek: &[u8], wrapped: &[u8]) -> EngineResult<Vec<u8>> {
    if wrapped.len() < 16 {
        return Err(decrypting("wrapped key too short"));
    }
    let kek = AesKey::new_decrypt(kek).map_err(|e| EngineError::Crypto(format!("{e:?}")))?;
    let mut key = vec![0; wrapped.len() - 8];
    let len = unwrap_key(&kek, None, &mut key, wrapped)
        .map_err(|_| decrypting("content key does not unwrap with the agreed key"))?;
    key.truncate(len);
    Ok(key)
}

fn decrypting(detail: &str) -> EngineError {
    EngineError::encryption(ErrorKey::SamlEngineDecryptingResponse, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::certificate::test_support::{ec_credential, rsa_credential};

    const ASSERTION: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<saml2:Assertion xmlns:saml2="urn:oasis:names:tc:SAML:2.0:assertion" ID="_abc"><saml2:Issuer>https://proxy.be</saml2:Issuer></saml2:Assertion>"#;

    fn cipher() -> ProtocolCipher {
        ProtocolCipher::new(
            DataEncryptionAlgorithm::Aes256Gcm,
            DataEncryptionAlgorithm::ALL.to_vec(),
            KeyTransportAlgorithm::RsaOaep,
            KeyAgreementAlgorithm::EcdhEs,
        )
    }

    #[test]
    fn can_encrypt_for_rsa_recipient() {
        let recipient = rsa_credential("connector.be");
        let versions = vec!["1.2".to_string()];
        let encrypted = cipher()
            .encrypt_assertion(ASSERTION, recipient.certificate(), &versions)
            .unwrap();
        assert!(encrypted.contains(KeyTransportAlgorithm::RsaOaep.uri()));
        assert!(!encrypted.contains("https://proxy.be"));

        let decrypted = cipher().decrypt_assertion(&encrypted, &recipient).unwrap();
        assert!(decrypted.starts_with("<saml2:Assertion"));
        assert!(decrypted.contains("https://proxy.be"));
    }

    #[test]
    fn can_fall_back_to_legacy_transport() {
        let recipient = rsa_credential("connector.be");
        let versions = vec!["1.1".to_string()];
        let encrypted = cipher()
            .encrypt_assertion(ASSERTION, recipient.certificate(), &versions)
            .unwrap();
        assert!(encrypted.contains(KeyTransportAlgorithm::RsaOaepMgf1p.uri()));
        assert!(cipher().decrypt_assertion(&encrypted, &recipient).is_ok());
    }

    #[test]
    fn can_encrypt_for_ec_recipient() {
        let recipient = ec_credential("connector.be");
        let encrypted = cipher()
            .encrypt_assertion(ASSERTION, recipient.certificate(), &[])
            .unwrap();
        assert!(encrypted.contains(KeyAgreementAlgorithm::EcdhEs.uri()));
        let decrypted = cipher().decrypt_assertion(&encrypted, &recipient).unwrap();
        assert!(decrypted.contains("ID=\"_abc\""));
    }

    #[test]
    fn can_refuse_wrong_key_and_disallowed_cipher() {
        let recipient = rsa_credential("connector.be");
        let encrypted = cipher()
            .encrypt_assertion(ASSERTION, recipient.certificate(), &["1.2".to_string()])
            .unwrap();
        let err = cipher()
            .decrypt_assertion(&encrypted, &rsa_credential("intruder.be"))
            .unwrap_err();
        assert_eq!(err.key(), ErrorKey::SamlEngineDecryptingResponse);

        let strict = ProtocolCipher::new(
            DataEncryptionAlgorithm::Aes128Gcm,
            vec![DataEncryptionAlgorithm::Aes128Gcm],
            KeyTransportAlgorithm::RsaOaep,
            KeyAgreementAlgorithm::EcdhEs,
        );
        let err = strict.decrypt_assertion(&encrypted, &recipient).unwrap_err();
        assert_eq!(err.key(), ErrorKey::InvalidEncryptionAlgorithm);
    }

    fn wrap_key(recipient: &Credential, oaep: MessageDigest, mgf1: MessageDigest, key: &[u8]) -> String {
        let public = recipient.certificate().public_key().unwrap();
        let mut encrypter = Encrypter::new(&public).unwrap();
        encrypter.set_rsa_padding(Padding::PKCS1_OAEP).unwrap();
        encrypter.set_rsa_oaep_md(oaep).unwrap();
        encrypter.set_rsa_mgf1_md(mgf1).unwrap();
        let mut wrapped = vec![0; encrypter.encrypt_len(key).unwrap()];
        let len = encrypter.encrypt(key, &mut wrapped).unwrap();
        wrapped.truncate(len);
        BASE64_STANDARD.encode(wrapped)
    }

    fn recover(method: &str, wrapped: &str, recipient: &Credential) -> EngineResult<Vec<u8>> {
        let xml = format!(
            r#"<xenc:EncryptedKey xmlns:xenc="http://www.w3.org/2001/04/xmlenc#" xmlns:xenc11="http://www.w3.org/2009/xmlenc11#" xmlns:ds="http://www.w3.org/2000/09/xmldsig#">{method}<xenc:CipherData><xenc:CipherValue>{wrapped}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedKey>"#
        );
        let document = parse_document(xml.as_bytes()).unwrap();
        let mut context = xpath_context(&document).unwrap();
        let encrypted_key = find_nodes(&mut context, "/xenc:EncryptedKey", None).remove(0);
        recover_key(&mut context, &encrypted_key, recipient.private_key().unwrap())
    }

    #[test]
    fn can_recover_key_with_default_oaep_digests() {
        let recipient = rsa_credential("connector.be");
        let key = [7u8; 32];
        let wrapped = wrap_key(&recipient, MessageDigest::sha1(), MessageDigest::sha1(), &key);
        let bare = format!(
            r#"<xenc:EncryptionMethod Algorithm="{}"/>"#,
            KeyTransportAlgorithm::RsaOaep.uri()
        );
        assert_eq!(recover(&bare, &wrapped, &recipient).unwrap(), key);

        let wrapped = wrap_key(&recipient, MessageDigest::sha256(), MessageDigest::sha512(), &key);
        let explicit = format!(
            r#"<xenc:EncryptionMethod Algorithm="{}"><ds:DigestMethod Algorithm="{}"/><xenc11:MGF Algorithm="http://www.w3.org/2009/xmlenc11#mgf1sha512"/></xenc:EncryptionMethod>"#,
            KeyTransportAlgorithm::RsaOaep.uri(),
            DigestAlgorithm::Sha256.uri()
        );
        assert_eq!(recover(&explicit, &wrapped, &recipient).unwrap(), key);
    }

    #[test]
    fn can_refuse_unknown_oaep_digest() {
        let recipient = rsa_credential("connector.be");
        let wrapped = wrap_key(&recipient, MessageDigest::sha1(), MessageDigest::sha1(), &[7u8; 32]);
        let method = format!(
            r#"<xenc:EncryptionMethod Algorithm="{}"><ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#md5"/></xenc:EncryptionMethod>"#,
            KeyTransportAlgorithm::RsaOaep.uri()
        );
        let err = recover(&method, &wrapped, &recipient).unwrap_err();
        assert_eq!(err.key(), ErrorKey::InvalidEncryptionAlgorithm);
    }
}
