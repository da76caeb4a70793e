use crate::error::Error;
use ::bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use ::bitcoin::ecdsa;
use ::bitcoin::hashes::Hash;
use ::bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use ::bitcoin::sighash::{EcdsaSighashType, SighashCache};
use ::bitcoin::{Address, CompressedPublicKey, Network, ScriptBuf, Transaction, TxOut, Witness};
use anyhow::{anyhow, bail, Context, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use bip39::Mnemonic;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

pub const SEED_LENGTH: usize = 64;

const ENVELOPE_VERSION: u32 = 1;
const SALT_LENGTH: usize = 16;
const NONCE_LENGTH: usize = 12;
const KEY_LENGTH: usize = 32;
const MNEMONIC_ENTROPY_LENGTH: usize = 16;

/// BIP39 seed an account's keys are derived from.
#[derive(Clone)]
pub struct Seed(Zeroizing<[u8; SEED_LENGTH]>);

impl Seed {
    pub fn from_mnemonic(mnemonic: &Mnemonic) -> Self {
        Seed(Zeroizing::new(mnemonic.to_seed("")))
    }

    pub fn master_key(&self, network: Network) -> Result<Xpriv> {
        Ok(Xpriv::new_master(network, &self.0[..])?)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SEED_LENGTH] = bytes
            .try_into()
            .map_err(|_| anyhow!("Seed must be {} bytes, got {}", SEED_LENGTH, bytes.len()))?;

        Ok(Seed(Zeroizing::new(bytes)))
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed([*****])")
    }
}

/// A fresh 12 word mnemonic.
pub fn generate_mnemonic() -> Result<Mnemonic> {
    let mut entropy = Zeroizing::new([0u8; MNEMONIC_ENTROPY_LENGTH]);
    rand::thread_rng().fill_bytes(&mut entropy[..]);

    Ok(Mnemonic::from_entropy(&entropy[..])?)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Cheap parameters for throwaway regtest wallets.
    pub const fn light() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn derive_key(&self, passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LENGTH),
        )
        .map_err(|e| anyhow!("Invalid key derivation parameters: {}", e))?;

        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
            .map_err(|e| anyhow!("Failed to derive encryption key: {}", e))?;

        Ok(key)
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

/// A seed encrypted under a passphrase, stored as JSON in the accounts
/// table.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSeed {
    version: u32,
    kdf: KdfParams,
    salt: String,
    nonce: String,
    ciphertext: String,
}

impl EncryptedSeed {
    pub fn encrypt(seed: &Seed, passphrase: &str, kdf: KdfParams) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_LENGTH];
        let mut nonce = [0u8; NONCE_LENGTH];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let key = kdf.derive_key(passphrase, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), &seed.0[..])
            .map_err(|e| anyhow!("Failed to encrypt seed: {}", e))?;

        Ok(Self {
            version: ENVELOPE_VERSION,
            kdf,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Fails with [`Error::AuthenticationFailure`] if the passphrase is
    /// wrong.
    pub fn decrypt(&self, passphrase: &str) -> Result<Seed> {
        if self.version != ENVELOPE_VERSION {
            bail!("Unsupported seed envelope version {}", self.version)
        }

        let salt = hex::decode(&self.salt).context("Malformed salt")?;
        let nonce = hex::decode(&self.nonce).context("Malformed nonce")?;
        let ciphertext = hex::decode(&self.ciphertext).context("Malformed ciphertext")?;
        if nonce.len() != NONCE_LENGTH {
            bail!("Nonce must be {} bytes", NONCE_LENGTH)
        }

        let key = self.kdf.derive_key(passphrase, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| Error::AuthenticationFailure)?,
        );

        Seed::from_slice(&plaintext)
    }

    pub fn kdf(&self) -> KdfParams {
        self.kdf
    }
}

impl fmt::Debug for EncryptedSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedSeed")
            .field("version", &self.version)
            .field("kdf", &self.kdf)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for EncryptedSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

impl FromStr for EncryptedSeed {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("Failed to parse encrypted seed")
    }
}

#[derive(Clone, Copy)]
pub struct SigningKey {
    pub secret: SecretKey,
    pub public: PublicKey,
}

/// Private keys needed to sign a transaction, keyed by the script they
/// unlock.
pub type SigningKeys = HashMap<ScriptBuf, SigningKey>;

/// Derives BIP44 keys and P2WPKH addresses, and signs with them.
///
/// Accounts live at `m/44'/coin'/account'`, addresses below them at
/// `change/index`.
#[derive(Clone)]
pub struct KeyChain {
    secp: Secp256k1<All>,
    network: Network,
    coin_type: u32,
}

impl KeyChain {
    pub fn new(network: Network, coin_type: u32) -> Self {
        Self {
            secp: Secp256k1::new(),
            network,
            coin_type,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn account_path(&self, account: u32) -> Result<DerivationPath> {
        Ok(DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(44)?,
            ChildNumber::from_hardened_idx(self.coin_type)?,
            ChildNumber::from_hardened_idx(account)?,
        ]))
    }

    pub fn address_path(&self, account: u32, is_change: bool, index: u32) -> Result<DerivationPath> {
        let path = self
            .account_path(account)?
            .child(ChildNumber::from_normal_idx(u32::from(is_change))?)
            .child(ChildNumber::from_normal_idx(index)?);

        Ok(path)
    }

    pub fn account_xpub(&self, master: &Xpriv, account: u32) -> Result<Xpub> {
        let xpriv = master.derive_priv(&self.secp, &self.account_path(account)?)?;

        Ok(Xpub::from_priv(&self.secp, &xpriv))
    }

    pub fn address(&self, account_xpub: &Xpub, is_change: bool, index: u32) -> Result<Address> {
        let path = [
            ChildNumber::from_normal_idx(u32::from(is_change))?,
            ChildNumber::from_normal_idx(index)?,
        ];
        let child = account_xpub.derive_pub(&self.secp, &path)?;

        Ok(Address::p2wpkh(&CompressedPublicKey(child.public_key), self.network))
    }

    pub fn signing_key(
        &self,
        master: &Xpriv,
        account: u32,
        is_change: bool,
        index: u32,
    ) -> Result<(ScriptBuf, SigningKey)> {
        let xpriv = master.derive_priv(&self.secp, &self.address_path(account, is_change, index)?)?;
        let secret = xpriv.private_key;
        let public = PublicKey::from_secret_key(&self.secp, &secret);
        let script = Address::p2wpkh(&CompressedPublicKey(public), self.network).script_pubkey();

        Ok((script, SigningKey { secret, public }))
    }

    /// Fills in P2WPKH witnesses for every input. `prevouts` must line up
    /// with the transaction inputs.
    pub fn sign(&self, transaction: &mut Transaction, prevouts: &[TxOut], keys: &SigningKeys) -> Result<()> {
        if prevouts.len() != transaction.input.len() {
            bail!(
                "Expected {} previous outputs, got {}",
                transaction.input.len(),
                prevouts.len()
            )
        }

        let mut witnesses = Vec::with_capacity(prevouts.len());
        {
            let mut cache = SighashCache::new(&*transaction);
            for (index, prevout) in prevouts.iter().enumerate() {
                let key = keys
                    .get(&prevout.script_pubkey)
                    .with_context(|| format!("No signing key for input {}", index))?;
                let sighash = cache.p2wpkh_signature_hash(
                    index,
                    &prevout.script_pubkey,
                    prevout.value,
                    EcdsaSighashType::All,
                )?;
                let message = Message::from_digest(sighash.to_byte_array());
                let signature = ecdsa::Signature {
                    signature: self.secp.sign_ecdsa(&message, &key.secret),
                    sighash_type: EcdsaSighashType::All,
                };

                witnesses.push(Witness::p2wpkh(&signature, &key.public));
            }
        }

        for (input, witness) in transaction.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }

        Ok(())
    }

    /// Checks the P2WPKH witness of input `index` against its previous
    /// output.
    pub fn verify_input(&self, transaction: &Transaction, index: usize, prevout: &TxOut) -> Result<()> {
        let witness = &transaction
            .input
            .get(index)
            .with_context(|| format!("No input {}", index))?
            .witness;
        if witness.len() != 2 {
            bail!("input {} does not carry a P2WPKH witness", index)
        }
        let (Some(signature), Some(public)) = (witness.nth(0), witness.nth(1)) else {
            bail!("input {} does not carry a P2WPKH witness", index)
        };

        let signature = ecdsa::Signature::from_slice(signature)?;
        let public = PublicKey::from_slice(public)?;
        if Address::p2wpkh(&CompressedPublicKey(public), self.network).script_pubkey() != prevout.script_pubkey {
            bail!("input {} is signed by a key that does not own it", index)
        }

        let sighash = SighashCache::new(transaction).p2wpkh_signature_hash(
            index,
            &prevout.script_pubkey,
            prevout.value,
            signature.sighash_type,
        )?;
        self.secp.verify_ecdsa(
            &Message::from_digest(sighash.to_byte_array()),
            &signature.signature,
            &public,
        )?;

        Ok(())
    }
}

impl fmt::Debug for KeyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyChain")
            .field("network", &self.network)
            .field("coin_type", &self.coin_type)
            .finish()
    }
}

/// Hex encoded chain code of a master key; unique per seed.
pub fn chain_code(master: &Xpriv) -> String {
    hex::encode(&master.encode()[13..45])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::bitcoin::absolute::LockTime;
    use ::bitcoin::transaction::Version;
    use ::bitcoin::{Amount, OutPoint, Sequence, TxIn};

    const WORDS: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn seed() -> Seed {
        Seed::from_mnemonic(&Mnemonic::from_str(WORDS).unwrap())
    }

    #[test]
    fn derives_bip44_style_segwit_addresses() {
        let keys = KeyChain::new(Network::Bitcoin, 0);
        let master = seed().master_key(Network::Bitcoin).unwrap();
        let xpub = keys.account_xpub(&master, 0).unwrap();

        let first = keys.address(&xpub, false, 0).unwrap();
        let (script, _) = keys.signing_key(&master, 0, false, 0).unwrap();

        assert_eq!(first.script_pubkey(), script);
        assert_ne!(first, keys.address(&xpub, true, 0).unwrap());
        assert_ne!(first, keys.address(&xpub, false, 1).unwrap());
        assert_eq!(
            keys.address_path(0, true, 5).unwrap(),
            DerivationPath::from_str("m/44'/0'/0'/1/5").unwrap()
        );
    }

    #[test]
    fn encrypted_seed_only_opens_with_its_passphrase() {
        let encrypted = EncryptedSeed::encrypt(&seed(), "correct horse", KdfParams::light()).unwrap();
        let stored = encrypted.to_string();
        let parsed = EncryptedSeed::from_str(&stored).unwrap();

        let opened = parsed.decrypt("correct horse").unwrap();
        assert_eq!(
            opened.master_key(Network::Regtest).unwrap(),
            seed().master_key(Network::Regtest).unwrap()
        );

        let err = parsed.decrypt("battery staple").unwrap_err();
        assert_eq!(Error::find(&err), Some(&Error::AuthenticationFailure));
    }

    #[test]
    fn debug_output_does_not_leak_secrets() {
        let encrypted = EncryptedSeed::encrypt(&seed(), "pw", KdfParams::light()).unwrap();

        assert_eq!(format!("{:?}", seed()), "Seed([*****])");
        assert!(!format!("{:?}", encrypted).contains(&encrypted.ciphertext));
    }

    #[test]
    fn signatures_verify_against_the_spent_output() {
        let keys = KeyChain::new(Network::Regtest, 1);
        let master = seed().master_key(Network::Regtest).unwrap();
        let (script, key) = keys.signing_key(&master, 0, false, 3).unwrap();
        let prevout = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: script.clone(),
        };
        let mut transaction = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(49_000),
                script_pubkey: script.clone(),
            }],
        };

        keys.sign(&mut transaction, &[prevout.clone()], &SigningKeys::from([(script, key)]))
            .unwrap();

        keys.verify_input(&transaction, 0, &prevout).unwrap();
        transaction.output[0].value = Amount::from_sat(1_000);
        assert!(keys.verify_input(&transaction, 0, &prevout).is_err());
    }

    #[test]
    fn chain_code_identifies_the_seed() {
        let master = seed().master_key(Network::Regtest).unwrap();
        let other = Seed::from_mnemonic(&generate_mnemonic().unwrap())
            .master_key(Network::Regtest)
            .unwrap();

        assert_eq!(chain_code(&master).len(), 64);
        assert_ne!(chain_code(&master), chain_code(&other));
    }
}
