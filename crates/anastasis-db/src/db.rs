use std::path::Path;
use std::sync::Mutex;

use rand::Rng;
use tracing::debug;

use anastasis_core::constants::{ACCOUNT_RETENTION_GRACE_SECONDS, CHALLENGE_CODE_MODULUS};
use anastasis_core::{
    AccountPublicKey, AccountSignature, Amount, EncryptedKeyShare, HashCode, PaymentSecret,
    Timestamp, TruthUuid,
};
use anastasis_crypto::hash_answer;

use crate::records::{
    AccountRecord, ChallengePaymentRecord, ChallengeRecord, PolicyPaymentRecord,
    RecoveryDocumentRecord, TruthRecord, TruthUploadPaymentRecord,
};
use crate::status::{
    AccountStatus, ChallengeCreation, CodeStatus, DbError, StoreStatus, TruthLookup,
    TruthStoreStatus,
};

/// Persistent provider state backed by sled (pure-Rust, no C dependencies).
///
/// Named trees:
///   accounts           — account pub (32)        → bincode(AccountRecord)
///   recovery_documents — pub ‖ version be32      → bincode(RecoveryDocumentRecord)
///   payments           — payment secret (32)     → bincode(PolicyPaymentRecord)
///   truths             — truth uuid (32)         → bincode(TruthRecord)
///   truth_payments     — truth uuid (32)         → bincode(TruthUploadPaymentRecord)
///   challenges         — truth uuid (32)         → bincode(ChallengeRecord)
///   challenge_payments — uuid ‖ payment secret   → bincode(ChallengePaymentRecord)
///
/// The database is the only synchronization point between concurrent
/// logical requests; `write_lock` serializes every multi-step mutation.
pub struct AnastasisDb {
    _db: sled::Db,
    accounts: sled::Tree,
    recovery_documents: sled::Tree,
    payments: sled::Tree,
    truths: sled::Tree,
    truth_payments: sled::Tree,
    challenges: sled::Tree,
    challenge_payments: sled::Tree,
    write_lock: Mutex<()>,
}

fn doc_key(account: &AccountPublicKey, version: u32) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(account.as_bytes());
    key[32..].copy_from_slice(&version.to_be_bytes());
    key
}

fn challenge_payment_key(uuid: &TruthUuid, ps: &PaymentSecret) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(uuid.as_bytes());
    key[32..].copy_from_slice(ps.as_bytes());
    key
}

fn get_record<T: serde::de::DeserializeOwned>(
    tree: &sled::Tree,
    key: &[u8],
) -> Result<Option<T>, DbError> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

fn put_record<T: serde::Serialize>(tree: &sled::Tree, key: &[u8], rec: &T) -> Result<(), DbError> {
    tree.insert(key, bincode::serialize(rec)?)?;
    Ok(())
}

impl AnastasisDb {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let db = sled::open(path)?;
        Ok(Self {
            accounts: db.open_tree("accounts")?,
            recovery_documents: db.open_tree("recovery_documents")?,
            payments: db.open_tree("payments")?,
            truths: db.open_tree("truths")?,
            truth_payments: db.open_tree("truth_payments")?,
            challenges: db.open_tree("challenges")?,
            challenge_payments: db.open_tree("challenge_payments")?,
            write_lock: Mutex::new(()),
            _db: db,
        })
    }

    // ── Accounts & recovery documents ────────────────────────────────────────

    pub fn lookup_account(&self, account: &AccountPublicKey) -> Result<AccountStatus, DbError> {
        let Some(rec) = get_record::<AccountRecord>(&self.accounts, account.as_bytes())? else {
            return Ok(AccountStatus::PaymentRequired);
        };
        match (&rec.current_hash, rec.latest_version) {
            (Some(hash), version) if version > 0 => Ok(AccountStatus::ValidHashReturned {
                paid_until: rec.paid_until,
                hash: hash.clone(),
                version,
            }),
            _ => Ok(AccountStatus::Empty {
                paid_until: rec.paid_until,
            }),
        }
    }

    pub fn get_recovery_document(
        &self,
        account: &AccountPublicKey,
        version: u32,
    ) -> Result<Option<RecoveryDocumentRecord>, DbError> {
        get_record(&self.recovery_documents, &doc_key(account, version))
    }

    pub fn get_latest_recovery_document(
        &self,
        account: &AccountPublicKey,
    ) -> Result<Option<RecoveryDocumentRecord>, DbError> {
        let Some(rec) = get_record::<AccountRecord>(&self.accounts, account.as_bytes())? else {
            return Ok(None);
        };
        if rec.latest_version == 0 {
            return Ok(None);
        }
        self.get_recovery_document(account, rec.latest_version)
    }

    /// Store a new recovery document version. Versions increase by
    /// exactly one per distinct upload; identical bytes are idempotent
    /// and do not consume the payment's upload quota.
    pub fn store_recovery_document(
        &self,
        account: &AccountPublicKey,
        sig: &AccountSignature,
        document_hash: &HashCode,
        document: &[u8],
        payment: &PaymentSecret,
    ) -> Result<StoreStatus, DbError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let Some(mut acc) = get_record::<AccountRecord>(&self.accounts, account.as_bytes())?
        else {
            return Ok(StoreStatus::PaymentRequired);
        };
        if acc.current_hash.as_ref() == Some(document_hash) {
            return Ok(StoreStatus::NoChange {
                version: acc.latest_version,
            });
        }
        let Some(mut pay) = get_record::<PolicyPaymentRecord>(&self.payments, payment.as_bytes())?
        else {
            return Ok(StoreStatus::PaymentRequired);
        };
        if !pay.paid {
            return Ok(StoreStatus::PaymentRequired);
        }
        if pay.post_counter == 0 {
            return Ok(StoreStatus::StoreLimitExceeded);
        }
        pay.post_counter -= 1;
        let version = acc.latest_version + 1;
        let doc = RecoveryDocumentRecord {
            account_sig: sig.clone(),
            document_hash: document_hash.clone(),
            document: document.to_vec(),
            version,
        };
        put_record(&self.recovery_documents, &doc_key(account, version), &doc)?;
        acc.latest_version = version;
        acc.current_hash = Some(document_hash.clone());
        put_record(&self.accounts, account.as_bytes(), &acc)?;
        put_record(&self.payments, payment.as_bytes(), &pay)?;
        debug!(account = %account, version, "recovery document stored");
        Ok(StoreStatus::Success { version })
    }

    // ── Policy payments & lifetime ───────────────────────────────────────────

    /// Whether `payment` is known, paid, and still has upload quota.
    pub fn check_payment_identifier(
        &self,
        payment: &PaymentSecret,
    ) -> Result<Option<(bool, bool)>, DbError> {
        Ok(
            get_record::<PolicyPaymentRecord>(&self.payments, payment.as_bytes())?
                .map(|p| (p.paid, p.post_counter > 0)),
        )
    }

    /// Record a (not yet paid) policy payment offer.
    pub fn record_recdoc_payment(
        &self,
        account: &AccountPublicKey,
        post_counter: u32,
        payment: &PaymentSecret,
        amount: &Amount,
        now: Timestamp,
    ) -> Result<(), DbError> {
        let rec = PolicyPaymentRecord {
            account: *account.as_bytes(),
            amount: amount.clone(),
            paid: false,
            post_counter,
            lifetime_granted: false,
            created_at: now,
        };
        put_record(&self.payments, payment.as_bytes(), &rec)
    }

    /// Mark `payment` as paid and extend the account lifetime by
    /// `delta` seconds. Idempotent per payment secret: a second call
    /// with the same secret extends nothing.
    pub fn increment_lifetime(
        &self,
        account: &AccountPublicKey,
        payment: &PaymentSecret,
        delta: i64,
        now: Timestamp,
    ) -> Result<Timestamp, DbError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut pay = get_record::<PolicyPaymentRecord>(&self.payments, payment.as_bytes())?
            .ok_or_else(|| DbError::Hard("increment_lifetime: unknown payment".into()))?;
        let mut acc = get_record::<AccountRecord>(&self.accounts, account.as_bytes())?
            .unwrap_or(AccountRecord {
                paid_until: now,
                latest_version: 0,
                current_hash: None,
            });
        if !pay.lifetime_granted {
            acc.paid_until = acc.paid_until.max(now) + delta;
            pay.lifetime_granted = true;
            pay.paid = true;
            put_record(&self.payments, payment.as_bytes(), &pay)?;
            put_record(&self.accounts, account.as_bytes(), &acc)?;
        }
        Ok(acc.paid_until)
    }

    /// Free-tier variant: set the account lifetime to an absolute time.
    pub fn update_lifetime(
        &self,
        account: &AccountPublicKey,
        payment: &PaymentSecret,
        paid_until: Timestamp,
    ) -> Result<(), DbError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut pay = get_record::<PolicyPaymentRecord>(&self.payments, payment.as_bytes())?
            .ok_or_else(|| DbError::Hard("update_lifetime: unknown payment".into()))?;
        pay.paid = true;
        pay.lifetime_granted = true;
        put_record(&self.payments, payment.as_bytes(), &pay)?;
        let mut acc = get_record::<AccountRecord>(&self.accounts, account.as_bytes())?
            .unwrap_or(AccountRecord {
                paid_until,
                latest_version: 0,
                current_hash: None,
            });
        acc.paid_until = acc.paid_until.max(paid_until);
        put_record(&self.accounts, account.as_bytes(), &acc)
    }

    // ── Truths ───────────────────────────────────────────────────────────────

    pub fn store_truth(
        &self,
        uuid: &TruthUuid,
        key_share_data: &EncryptedKeyShare,
        truth_mime: &str,
        encrypted_truth: &[u8],
        method: &str,
        paid_until: Timestamp,
    ) -> Result<TruthStoreStatus, DbError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        if let Some(existing) = get_record::<TruthRecord>(&self.truths, uuid.as_bytes())? {
            let identical = existing.method == method
                && existing.truth_mime == truth_mime
                && existing.encrypted_truth == encrypted_truth
                && existing.key_share_data == *key_share_data;
            return Ok(if identical {
                TruthStoreStatus::Idempotent
            } else {
                TruthStoreStatus::Conflict
            });
        }
        let rec = TruthRecord {
            key_share_data: key_share_data.clone(),
            method: method.to_string(),
            truth_mime: truth_mime.to_string(),
            encrypted_truth: encrypted_truth.to_vec(),
            paid_until,
        };
        put_record(&self.truths, uuid.as_bytes(), &rec)?;
        debug!(uuid = %uuid.short(), method, "truth stored");
        Ok(TruthStoreStatus::Success)
    }

    /// Load the challenge material of a truth (encrypted truth, MIME
    /// hint, method tag).
    pub fn get_escrow_challenge(
        &self,
        uuid: &TruthUuid,
        now: Timestamp,
    ) -> Result<TruthLookup<(Vec<u8>, String, String)>, DbError> {
        match get_record::<TruthRecord>(&self.truths, uuid.as_bytes())? {
            None => Ok(TruthLookup::Unknown),
            Some(rec) if rec.paid_until < now => Ok(TruthLookup::Expired),
            Some(rec) => Ok(TruthLookup::Found((
                rec.encrypted_truth,
                rec.truth_mime,
                rec.method,
            ))),
        }
    }

    pub fn get_key_share(
        &self,
        uuid: &TruthUuid,
        now: Timestamp,
    ) -> Result<TruthLookup<EncryptedKeyShare>, DbError> {
        match get_record::<TruthRecord>(&self.truths, uuid.as_bytes())? {
            None => Ok(TruthLookup::Unknown),
            Some(rec) if rec.paid_until < now => Ok(TruthLookup::Expired),
            Some(rec) => Ok(TruthLookup::Found(rec.key_share_data)),
        }
    }

    pub fn check_truth_upload_paid(
        &self,
        uuid: &TruthUuid,
    ) -> Result<Option<Timestamp>, DbError> {
        Ok(
            get_record::<TruthUploadPaymentRecord>(&self.truth_payments, uuid.as_bytes())?
                .map(|p| p.paid_until),
        )
    }

    pub fn record_truth_upload_payment(
        &self,
        uuid: &TruthUuid,
        amount: &Amount,
        paid_until: Timestamp,
    ) -> Result<(), DbError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let paid_until = match get_record::<TruthUploadPaymentRecord>(
            &self.truth_payments,
            uuid.as_bytes(),
        )? {
            Some(existing) => existing.paid_until.max(paid_until),
            None => paid_until,
        };
        put_record(
            &self.truth_payments,
            uuid.as_bytes(),
            &TruthUploadPaymentRecord {
                amount: amount.clone(),
                paid_until,
            },
        )
    }

    // ── Challenge codes ──────────────────────────────────────────────────────

    /// The single rate-limit gate for challenge creation. Inside the
    /// rotation period the cached code is returned and one retry is
    /// consumed; once the counter reaches zero the caller is rate
    /// limited until the code rotates out.
    pub fn create_challenge_code(
        &self,
        uuid: &TruthUuid,
        rotation_period: i64,
        validity_period: i64,
        retry_counter: u32,
        now: Timestamp,
    ) -> Result<ChallengeCreation, DbError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        if let Some(mut rec) = get_record::<ChallengeRecord>(&self.challenges, uuid.as_bytes())? {
            let live = now < rec.created_at + rec.rotation_period
                && now < rec.created_at + rec.validity_period;
            if live {
                if rec.retry_counter_left == 0 {
                    return Ok(ChallengeCreation::RateLimited);
                }
                rec.retry_counter_left -= 1;
                put_record(&self.challenges, uuid.as_bytes(), &rec)?;
                return Ok(ChallengeCreation::Cached {
                    code: rec.code,
                    last_sent_at: rec.last_sent_at,
                });
            }
        }
        let code = rand::thread_rng().gen_range(0..CHALLENGE_CODE_MODULUS);
        let rec = ChallengeRecord {
            code,
            created_at: now,
            retry_counter_left: retry_counter,
            rotation_period,
            validity_period,
            satisfied: false,
            last_sent_at: None,
        };
        put_record(&self.challenges, uuid.as_bytes(), &rec)?;
        debug!(uuid = %uuid.short(), "fresh challenge code created");
        Ok(ChallengeCreation::Fresh { code })
    }

    /// Compare a hashed answer against the live code. A match marks the
    /// code satisfied; a mismatch neither consumes retries nor
    /// invalidates the code (rate accounting lives in
    /// [`Self::create_challenge_code`]).
    pub fn verify_challenge_code(
        &self,
        uuid: &TruthUuid,
        hashed_response: &HashCode,
        now: Timestamp,
    ) -> Result<CodeStatus, DbError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let Some(mut rec) = get_record::<ChallengeRecord>(&self.challenges, uuid.as_bytes())?
        else {
            return Ok(CodeStatus::NoResults);
        };
        if now >= rec.created_at + rec.validity_period {
            return Ok(CodeStatus::NoResults);
        }
        if hash_answer(rec.code) != *hashed_response {
            return Ok(CodeStatus::Mismatch);
        }
        if !rec.satisfied {
            rec.satisfied = true;
            put_record(&self.challenges, uuid.as_bytes(), &rec)?;
        }
        Ok(CodeStatus::ValidCodeStored {
            code: rec.code,
            satisfied: rec.satisfied,
        })
    }

    /// Record that the challenge was transmitted to the user; the
    /// timestamp drives the retransmission backoff (208).
    pub fn mark_challenge_sent(
        &self,
        _payment: Option<&PaymentSecret>,
        uuid: &TruthUuid,
        code: u64,
        now: Timestamp,
    ) -> Result<(), DbError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let Some(mut rec) = get_record::<ChallengeRecord>(&self.challenges, uuid.as_bytes())?
        else {
            return Ok(());
        };
        if rec.code == code {
            rec.last_sent_at = Some(now);
            put_record(&self.challenges, uuid.as_bytes(), &rec)?;
        }
        Ok(())
    }

    // ── Challenge payments & refunds ─────────────────────────────────────────

    pub fn record_challenge_payment(
        &self,
        uuid: &TruthUuid,
        payment: &PaymentSecret,
        cost: &Amount,
        now: Timestamp,
    ) -> Result<(), DbError> {
        put_record(
            &self.challenge_payments,
            &challenge_payment_key(uuid, payment),
            &ChallengePaymentRecord {
                payment_secret: payment.clone(),
                amount: cost.clone(),
                paid: false,
                refunded: false,
                created_at: now,
            },
        )
    }

    /// Whether this (truth, payment) pair exists and is paid.
    pub fn check_challenge_payment(
        &self,
        payment: &PaymentSecret,
        uuid: &TruthUuid,
    ) -> Result<Option<bool>, DbError> {
        Ok(get_record::<ChallengePaymentRecord>(
            &self.challenge_payments,
            &challenge_payment_key(uuid, payment),
        )?
        .map(|p| p.paid && !p.refunded))
    }

    pub fn update_challenge_payment(
        &self,
        uuid: &TruthUuid,
        payment: &PaymentSecret,
    ) -> Result<(), DbError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let key = challenge_payment_key(uuid, payment);
        let Some(mut rec) = get_record::<ChallengePaymentRecord>(&self.challenge_payments, &key)?
        else {
            return Err(DbError::Hard("update_challenge_payment: unknown".into()));
        };
        rec.paid = true;
        put_record(&self.challenge_payments, &key, &rec)
    }

    /// Most recent still-open (unpaid, unrefunded) payment offer for a
    /// truth, to reuse its order instead of creating a new one.
    pub fn lookup_challenge_payment(
        &self,
        uuid: &TruthUuid,
    ) -> Result<Option<PaymentSecret>, DbError> {
        let mut best: Option<ChallengePaymentRecord> = None;
        for item in self.challenge_payments.scan_prefix(uuid.as_bytes()) {
            let (_, bytes) = item?;
            let rec: ChallengePaymentRecord = bincode::deserialize(&bytes)?;
            if rec.paid || rec.refunded {
                continue;
            }
            if best.as_ref().map(|b| b.created_at < rec.created_at).unwrap_or(true) {
                best = Some(rec);
            }
        }
        Ok(best.map(|b| b.payment_secret))
    }

    /// Mark a refund as issued; at most once per (truth, payment).
    /// Returns false when it was already recorded.
    pub fn record_challenge_refund(
        &self,
        uuid: &TruthUuid,
        payment: &PaymentSecret,
    ) -> Result<bool, DbError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let key = challenge_payment_key(uuid, payment);
        let Some(mut rec) = get_record::<ChallengePaymentRecord>(&self.challenge_payments, &key)?
        else {
            return Err(DbError::Hard("record_challenge_refund: unknown".into()));
        };
        if rec.refunded {
            return Ok(false);
        }
        rec.refunded = true;
        put_record(&self.challenge_payments, &key, &rec)?;
        Ok(true)
    }

    // ── Garbage collection ───────────────────────────────────────────────────

    /// Purge expired state: accounts past their retention grace (with
    /// their documents), lapsed truths and their payment/challenge rows,
    /// and dead challenge codes. Returns the number of removed rows.
    pub fn gc(&self, now: Timestamp) -> Result<usize, DbError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut removed = 0;

        let mut dead_accounts = Vec::new();
        for item in self.accounts.iter() {
            let (key, bytes) = item?;
            let rec: AccountRecord = bincode::deserialize(&bytes)?;
            if rec.paid_until + ACCOUNT_RETENTION_GRACE_SECONDS < now {
                dead_accounts.push((key.to_vec(), rec.latest_version));
            }
        }
        for (key, latest) in dead_accounts {
            for version in 1..=latest {
                let mut doc_key = key.clone();
                doc_key.extend_from_slice(&version.to_be_bytes());
                if self.recovery_documents.remove(doc_key)?.is_some() {
                    removed += 1;
                }
            }
            self.accounts.remove(key)?;
            removed += 1;
        }

        let mut dead_truths = Vec::new();
        for item in self.truths.iter() {
            let (key, bytes) = item?;
            let rec: TruthRecord = bincode::deserialize(&bytes)?;
            if rec.paid_until < now {
                dead_truths.push(key.to_vec());
            }
        }
        for key in dead_truths {
            self.truths.remove(&key)?;
            self.truth_payments.remove(&key)?;
            self.challenges.remove(&key)?;
            removed += 1;
        }

        let mut dead_challenges = Vec::new();
        for item in self.challenges.iter() {
            let (key, bytes) = item?;
            let rec: ChallengeRecord = bincode::deserialize(&bytes)?;
            if rec.created_at + rec.validity_period < now {
                dead_challenges.push(key.to_vec());
            }
        }
        for key in dead_challenges {
            self.challenges.remove(&key)?;
            removed += 1;
        }

        Ok(removed)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), DbError> {
        self._db.flush()?;
        Ok(())
    }
}
