use std::sync::Arc;

use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::{self, SaltString, rand_core::OsRng},
};
use tokio::task;

pub struct Config {
    pub secret_key: Vec<u8>,
    pub iterations: u32,
    pub parallelism: u32,
    pub memory_cost: u32,
}

/// Argon2id hasher keyed with a secret pepper. Hashing and verification run
/// on the blocking pool.
#[derive(Clone)]
pub struct ArgonHasher {
    argon2: Arc<Argon2<'static>>,
}

impl ArgonHasher {
    pub fn new(config: Config) -> Result<Self, password_hash::Error> {
        let secret_bytes: &'static [u8] = Box::leak(config.secret_key.into_boxed_slice());

        let argon2 = Argon2::new_with_secret(
            secret_bytes,
            Algorithm::Argon2id,
            Version::V0x13,
            Params::new(
                config.memory_cost,
                config.iterations,
                config.parallelism,
                None,
            )?,
        )?;

        Ok(Self {
            argon2: Arc::new(argon2),
        })
    }

    pub async fn hash(
        &self,
        password: impl AsRef<[u8]>,
    ) -> Result<String, password_hash::Error> {
        let argon2 = self.argon2.clone();
        let password = password.as_ref().to_owned();

        let res = task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            argon2
                .hash_password(&password, &salt)
                .map(|ph| ph.to_string())
        });

        res.await.map_err(|_| password_hash::Error::Crypto)?
    }

    /// Ok(()) when the password matches; `Error::Password` when it does not.
    pub async fn verify(
        &self,
        password: impl AsRef<[u8]>,
        hash: impl AsRef<str>,
    ) -> Result<(), password_hash::Error> {
        let argon2 = self.argon2.clone();
        let password = password.as_ref().to_owned();
        let hash = hash.as_ref().to_owned();

        let res = task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&hash)?;
            argon2.verify_password(&password, &parsed)
        });

        res.await.map_err(|_| password_hash::Error::Crypto)?
    }
}
