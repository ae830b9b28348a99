//! Persistent state. A single redb file holds every ticket, the fee-xpub
//! history, the vote-change audit log, alternate signing addresses and the
//! process keys. Ticket access is additionally disciplined by one
//! process-wide reader-writer lock so concurrent HTTP handlers compose
//! with redb's single-writer transactions.

use crate::errors::Error;
use crate::models::{AltSignAddrRecord, FeeStatus, FeeXPub, Ticket, TicketOutcome, VoteChangeRecord};
use ed25519_dalek::SigningKey;
use log::info;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::Rng;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const LATEST_VERSION: u32 = 5;

/// Default cap on retained vote-change records per ticket.
pub const DEFAULT_MAX_VOTE_CHANGES: u32 = 10;

const ROOT: TableDefinition<&str, &[u8]> = TableDefinition::new("vspd");
const TICKETS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("tickets");
const VOTE_CHANGES: TableDefinition<(&str, u32), &[u8]> = TableDefinition::new("votechange");
const ALT_SIGN_ADDRS: TableDefinition<&str, &[u8]> = TableDefinition::new("altsignaddr");
const XPUBS: TableDefinition<u32, &[u8]> = TableDefinition::new("xpub");

// Layout used before version 3: one JSON blob per ticket hash.
const TICKETS_V1: TableDefinition<&str, &[u8]> = TableDefinition::new("tickets");

const K_VERSION: &str = "version";
const K_COOKIE_SECRET: &str = "cookiesecret";
const K_PRIVATE_KEY: &str = "privatekey";
const K_PUBLIC_KEY: &str = "publickey";
// Pre-version-5 scalar xpub keys.
const K_FEE_XPUB: &str = "feexpub";
const K_LAST_ADDR_INDEX: &str = "lastaddressindex";

const F_COMMITMENT_ADDRESS: &str = "commitmentaddress";
const F_PURCHASE_HEIGHT: &str = "purchaseheight";
const F_FEE_ADDRESS_XPUB_ID: &str = "feeaddressxpubid";
const F_FEE_ADDRESS_INDEX: &str = "feeaddressindex";
const F_FEE_ADDRESS: &str = "feeaddress";
const F_FEE_AMOUNT: &str = "feeamount";
const F_FEE_EXPIRATION: &str = "feeexpiration";
const F_FEE_TX_HEX: &str = "feetxhex";
const F_FEE_TX_HASH: &str = "feetxhash";
const F_FEE_TX_STATUS: &str = "feetxstatus";
const F_VOTING_WIF: &str = "votingwif";
const F_CONFIRMED: &str = "confirmed";
const F_VOTE_CHOICES: &str = "votechoices";
const F_TSPEND_POLICY: &str = "tspendpolicy";
const F_TREASURY_POLICY: &str = "treasurypolicy";
const F_OUTCOME: &str = "outcome";

pub struct Store {
    db: Database,
    path: PathBuf,
    tickets_lock: RwLock<()>,
    max_vote_changes: u32,
}

impl Store {
    /// Opens or creates the database at `path`, generating process keys on
    /// first use and applying any pending schema migrations, one
    /// transaction per version step.
    pub fn open(path: impl AsRef<Path>, max_vote_changes: u32) -> Result<Store, Error> {
        let db = Database::create(path.as_ref())?;
        let store = Store {
            db,
            path: path.as_ref().to_path_buf(),
            tickets_lock: RwLock::new(()),
            max_vote_changes,
        };
        store.init()?;
        store.upgrade()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), Error> {
        let wtx = self.db.begin_write()?;
        {
            let mut root = wtx.open_table(ROOT)?;
            if root.get(K_VERSION)?.is_none() {
                info!("initializing new database");
                root.insert(K_VERSION, LATEST_VERSION.to_le_bytes().as_slice())?;

                let secret: [u8; 32] = rand::thread_rng().gen();
                root.insert(K_COOKIE_SECRET, secret.as_slice())?;

                let key = SigningKey::generate(&mut OsRng);
                root.insert(K_PRIVATE_KEY, key.to_bytes().as_slice())?;
                root.insert(K_PUBLIC_KEY, key.verifying_key().to_bytes().as_slice())?;

                drop(root);
                wtx.open_table(TICKETS)?;
                wtx.open_table(VOTE_CHANGES)?;
                wtx.open_table(ALT_SIGN_ADDRS)?;
                wtx.open_table(XPUBS)?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn version(&self) -> Result<u32, Error> {
        let rtx = self.db.begin_read()?;
        let root = rtx.open_table(ROOT)?;
        let raw = root
            .get(K_VERSION)?
            .ok_or_else(|| Error::Db("missing database version".to_owned()))?;
        decode_u32(Some(raw.value().to_vec()))
    }

    fn set_version(wtx: &redb::WriteTransaction, version: u32) -> Result<(), Error> {
        let mut root = wtx.open_table(ROOT)?;
        root.insert(K_VERSION, version.to_le_bytes().as_slice())?;
        Ok(())
    }

    fn upgrade(&self) -> Result<(), Error> {
        loop {
            let version = self.version()?;
            if version == LATEST_VERSION {
                return Ok(());
            }
            if version > LATEST_VERSION {
                return Err(Error::Db(format!(
                    "database version {} is newer than latest supported version {}",
                    version, LATEST_VERSION
                )));
            }
            info!("upgrading database from version {} to {}", version, version + 1);
            match version {
                1 => self.upgrade_to_v2()?,
                2 => self.upgrade_to_v3()?,
                3 => self.upgrade_to_v4()?,
                4 => self.upgrade_to_v5()?,
                v => return Err(Error::Db(format!("no upgrade path from version {}", v))),
            }
        }
    }

    // Confirmed fees never need re-broadcast, so their raw hex is dropped
    // to reclaim space.
    fn upgrade_to_v2(&self) -> Result<(), Error> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(TICKETS_V1)?;
            let mut updates: Vec<(String, Ticket)> = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                let mut ticket: Ticket = serde_json::from_slice(v.value())
                    .map_err(|e| Error::Db(format!("cannot decode ticket: {}", e)))?;
                if ticket.fee_tx_status == FeeStatus::Confirmed && !ticket.fee_tx_hex.is_empty() {
                    ticket.fee_tx_hex.clear();
                    updates.push((k.value().to_owned(), ticket));
                }
            }
            for (hash, ticket) in updates {
                let blob = serde_json::to_vec(&ticket)
                    .map_err(|e| Error::Db(format!("cannot encode ticket: {}", e)))?;
                table.insert(hash.as_str(), blob.as_slice())?;
            }
        }
        Self::set_version(&wtx, 2)?;
        wtx.commit()?;
        Ok(())
    }

    // Tickets move from one JSON blob per hash to one key per field.
    fn upgrade_to_v3(&self) -> Result<(), Error> {
        let wtx = self.db.begin_write()?;
        {
            let mut tickets: Vec<Ticket> = Vec::new();
            {
                let table = wtx.open_table(TICKETS_V1)?;
                for entry in table.iter()? {
                    let (k, v) = entry?;
                    let mut ticket: Ticket = serde_json::from_slice(v.value())
                        .map_err(|e| Error::Db(format!("cannot decode ticket: {}", e)))?;
                    ticket.hash = k.value().to_owned();
                    tickets.push(ticket);
                }
            }
            wtx.delete_table(TICKETS_V1)?;
            let mut table = wtx.open_table(TICKETS)?;
            for ticket in &tickets {
                write_ticket(&mut table, ticket)?;
            }
        }
        Self::set_version(&wtx, 3)?;
        wtx.commit()?;
        Ok(())
    }

    fn upgrade_to_v4(&self) -> Result<(), Error> {
        let wtx = self.db.begin_write()?;
        wtx.open_table(ALT_SIGN_ADDRS)?;
        Self::set_version(&wtx, 4)?;
        wtx.commit()?;
        Ok(())
    }

    // The single configured xpub becomes record zero of the xpub table and
    // every existing ticket is stamped as derived from it.
    fn upgrade_to_v5(&self) -> Result<(), Error> {
        let wtx = self.db.begin_write()?;
        {
            let (key, last_idx) = {
                let mut root = wtx.open_table(ROOT)?;
                let key = root.get(K_FEE_XPUB)?.map(|g| g.value().to_vec());
                let idx = root.get(K_LAST_ADDR_INDEX)?.map(|g| g.value().to_vec());
                root.remove(K_FEE_XPUB)?;
                root.remove(K_LAST_ADDR_INDEX)?;
                (key, idx)
            };
            let mut xpubs = wtx.open_table(XPUBS)?;
            if let Some(key) = key {
                let record = FeeXPub {
                    id: 0,
                    key: decode_string(Some(key))?,
                    last_used_idx: decode_u32(last_idx)?,
                    retired: 0,
                };
                let blob = serde_json::to_vec(&record)
                    .map_err(|e| Error::Db(format!("cannot encode xpub: {}", e)))?;
                xpubs.insert(0u32, blob.as_slice())?;
            }
            drop(xpubs);

            let mut table = wtx.open_table(TICKETS)?;
            let mut hashes: Vec<String> = Vec::new();
            for entry in table.iter()? {
                let (k, _) = entry?;
                let (hash, field) = k.value();
                if field == F_FEE_TX_STATUS {
                    hashes.push(hash.to_owned());
                }
            }
            for hash in hashes {
                table.insert(
                    (hash.as_str(), F_FEE_ADDRESS_XPUB_ID),
                    0u32.to_le_bytes().as_slice(),
                )?;
            }
        }
        Self::set_version(&wtx, 5)?;
        wtx.commit()?;
        Ok(())
    }

    // Ticket operations.

    pub fn insert_new_ticket(&self, ticket: &Ticket) -> Result<(), Error> {
        if ticket.hash.is_empty() {
            return Err(Error::Db("ticket hash is empty".to_owned()));
        }
        let _guard = self.tickets_lock.write();
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(TICKETS)?;
            if table
                .get((ticket.hash.as_str(), F_FEE_TX_STATUS))?
                .is_some()
            {
                return Err(Error::Db(format!("ticket {} already exists", ticket.hash)));
            }
            write_ticket(&mut table, ticket)?;
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn update_ticket(&self, ticket: &Ticket) -> Result<(), Error> {
        let _guard = self.tickets_lock.write();
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(TICKETS)?;
            if table
                .get((ticket.hash.as_str(), F_FEE_TX_STATUS))?
                .is_none()
            {
                return Err(Error::Db(format!("no ticket with hash {}", ticket.hash)));
            }
            write_ticket(&mut table, ticket)?;
        }
        wtx.commit()?;
        Ok(())
    }

    /// Removes a ticket and its vote-change history.
    pub fn delete_ticket(&self, hash: &str) -> Result<(), Error> {
        let _guard = self.tickets_lock.write();
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(TICKETS)?;
            if table.get((hash, F_FEE_TX_STATUS))?.is_none() {
                return Err(Error::Db(format!("no ticket with hash {}", hash)));
            }
            for field in TICKET_FIELDS {
                table.remove((hash, field))?;
            }
            drop(table);

            let mut changes = wtx.open_table(VOTE_CHANGES)?;
            let indices: Vec<u32> = changes
                .range((hash, 0u32)..=(hash, u32::MAX))?
                .map(|e| e.map(|(k, _)| k.value().1))
                .collect::<Result<_, _>>()?;
            for idx in indices {
                changes.remove((hash, idx))?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn get_ticket(&self, hash: &str) -> Result<Option<Ticket>, Error> {
        let _guard = self.tickets_lock.read();
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(TICKETS)?;
        read_ticket(&table, hash)
    }

    /// Counts of tickets with a confirmed fee, split by outcome.
    pub fn count_tickets(&self) -> Result<(i64, i64, i64), Error> {
        let (mut voting, mut voted, mut revoked) = (0, 0, 0);
        for ticket in self.all_tickets()? {
            if ticket.fee_tx_status != FeeStatus::Confirmed {
                continue;
            }
            match ticket.outcome {
                TicketOutcome::None => voting += 1,
                TicketOutcome::Voted => voted += 1,
                TicketOutcome::Revoked => revoked += 1,
            }
        }
        Ok((voting, voted, revoked))
    }

    pub fn all_tickets(&self) -> Result<Vec<Ticket>, Error> {
        self.filter_tickets(|_| true)
    }

    pub fn unconfirmed_tickets(&self) -> Result<Vec<Ticket>, Error> {
        self.filter_tickets(|t| !t.confirmed)
    }

    /// Fees received but not yet broadcast, for confirmed tickets.
    pub fn pending_fees(&self) -> Result<Vec<Ticket>, Error> {
        self.filter_tickets(|t| t.confirmed && t.fee_tx_status == FeeStatus::Received)
    }

    /// Fees broadcast but not yet confirmed.
    pub fn unconfirmed_fees(&self) -> Result<Vec<Ticket>, Error> {
        self.filter_tickets(|t| t.fee_tx_status == FeeStatus::Broadcast)
    }

    pub fn votable_tickets(&self) -> Result<Vec<Ticket>, Error> {
        self.filter_tickets(|t| {
            t.fee_tx_status == FeeStatus::Confirmed && t.outcome == TicketOutcome::None
        })
    }

    pub fn voted_tickets(&self) -> Result<Vec<Ticket>, Error> {
        self.filter_tickets(|t| t.outcome == TicketOutcome::Voted)
    }

    pub fn missing_purchase_height(&self) -> Result<Vec<Ticket>, Error> {
        self.filter_tickets(|t| t.confirmed && t.purchase_height == 0)
    }

    fn filter_tickets(&self, pred: impl Fn(&Ticket) -> bool) -> Result<Vec<Ticket>, Error> {
        let _guard = self.tickets_lock.read();
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(TICKETS)?;
        let mut out = Vec::new();
        for ticket in collect_tickets(&table)? {
            if pred(&ticket) {
                out.push(ticket);
            }
        }
        Ok(out)
    }

    // Fee xpub records.

    pub fn all_fee_xpubs(&self) -> Result<Vec<FeeXPub>, Error> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(XPUBS)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            let record: FeeXPub = serde_json::from_slice(v.value())
                .map_err(|e| Error::Db(format!("cannot decode xpub: {}", e)))?;
            out.push(record);
        }
        Ok(out)
    }

    /// The active (highest-ID, unretired) xpub record.
    pub fn fee_xpub(&self) -> Result<FeeXPub, Error> {
        let xpubs = self.all_fee_xpubs()?;
        let active = xpubs
            .into_iter()
            .max_by_key(|x| x.id)
            .ok_or_else(|| Error::Db("no fee xpub in database".to_owned()))?;
        if active.retired != 0 {
            return Err(Error::Db("active xpub is retired".to_owned()));
        }
        Ok(active)
    }

    /// Ensures the configured xpub is the active record, retiring the
    /// previous one when the key changed. An xpub value can never be used
    /// by two records.
    pub fn upsert_fee_xpub(&self, key: &str, now: i64) -> Result<FeeXPub, Error> {
        let wtx = self.db.begin_write()?;
        let active = {
            let mut table = wtx.open_table(XPUBS)?;
            let mut records: Vec<FeeXPub> = Vec::new();
            for entry in table.iter()? {
                let (_, v) = entry?;
                records.push(
                    serde_json::from_slice(v.value())
                        .map_err(|e| Error::Db(format!("cannot decode xpub: {}", e)))?,
                );
            }
            let current = records.iter().max_by_key(|x| x.id).cloned();
            match current {
                Some(current) if current.key == key => current,
                current => {
                    if records.iter().any(|x| x.key == key) {
                        return Err(Error::Db(
                            "cannot reuse a previously retired xpub".to_owned(),
                        ));
                    }
                    let next_id = match &current {
                        Some(c) => {
                            let mut retired = c.clone();
                            retired.retired = now;
                            let blob = serde_json::to_vec(&retired)
                                .map_err(|e| Error::Db(e.to_string()))?;
                            table.insert(retired.id, blob.as_slice())?;
                            info!("retiring fee xpub {}", c.id);
                            c.id + 1
                        }
                        None => 0,
                    };
                    let record = FeeXPub {
                        id: next_id,
                        key: key.to_owned(),
                        last_used_idx: 0,
                        retired: 0,
                    };
                    let blob =
                        serde_json::to_vec(&record).map_err(|e| Error::Db(e.to_string()))?;
                    table.insert(next_id, blob.as_slice())?;
                    record
                }
            }
        };
        wtx.commit()?;
        Ok(active)
    }

    pub fn set_last_addr_index(&self, xpub_id: u32, idx: u32) -> Result<(), Error> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(XPUBS)?;
            let mut record: FeeXPub = {
                let raw = table
                    .get(xpub_id)?
                    .ok_or_else(|| Error::Db(format!("no xpub with id {}", xpub_id)))?;
                serde_json::from_slice(raw.value())
                    .map_err(|e| Error::Db(format!("cannot decode xpub: {}", e)))?
            };
            record.last_used_idx = idx;
            let blob = serde_json::to_vec(&record).map_err(|e| Error::Db(e.to_string()))?;
            table.insert(xpub_id, blob.as_slice())?;
        }
        wtx.commit()?;
        Ok(())
    }

    // Alternate signing addresses.

    pub fn alt_sign_addr(&self, hash: &str) -> Result<Option<AltSignAddrRecord>, Error> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(ALT_SIGN_ADDRS)?;
        match table.get(hash)? {
            None => Ok(None),
            Some(raw) => Ok(Some(
                serde_json::from_slice(raw.value())
                    .map_err(|e| Error::Db(format!("cannot decode alt sign addr: {}", e)))?,
            )),
        }
    }

    /// Records are immutable once inserted; a second insert for the same
    /// ticket is an error.
    pub fn insert_alt_sign_addr(
        &self,
        hash: &str,
        record: &AltSignAddrRecord,
    ) -> Result<(), Error> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(ALT_SIGN_ADDRS)?;
            if table.get(hash)?.is_some() {
                return Err(Error::Db(format!(
                    "alt sign addr for ticket {} already exists",
                    hash
                )));
            }
            let blob = serde_json::to_vec(record).map_err(|e| Error::Db(e.to_string()))?;
            table.insert(hash, blob.as_slice())?;
        }
        wtx.commit()?;
        Ok(())
    }

    // Vote change audit log.

    /// Appends a record, evicting the oldest once the per-ticket bound is
    /// reached.
    pub fn save_vote_change(&self, hash: &str, record: &VoteChangeRecord) -> Result<(), Error> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(VOTE_CHANGES)?;
            let mut indices: Vec<u32> = table
                .range((hash, 0u32)..=(hash, u32::MAX))?
                .map(|e| e.map(|(k, _)| k.value().1))
                .collect::<Result<_, _>>()?;
            indices.sort_unstable();
            while !indices.is_empty() && indices.len() as u32 >= self.max_vote_changes {
                let oldest = indices.remove(0);
                table.remove((hash, oldest))?;
            }
            let next = indices.last().map(|i| i + 1).unwrap_or(0);
            let blob = serde_json::to_vec(record).map_err(|e| Error::Db(e.to_string()))?;
            table.insert((hash, next), blob.as_slice())?;
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn vote_changes(&self, hash: &str) -> Result<Vec<(u32, VoteChangeRecord)>, Error> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(VOTE_CHANGES)?;
        let mut out = Vec::new();
        for entry in table.range((hash, 0u32)..=(hash, u32::MAX))? {
            let (k, v) = entry?;
            let record: VoteChangeRecord = serde_json::from_slice(v.value())
                .map_err(|e| Error::Db(format!("cannot decode vote change: {}", e)))?;
            out.push((k.value().1, record));
        }
        Ok(out)
    }

    // Process keys.

    pub fn signing_key(&self) -> Result<SigningKey, Error> {
        let rtx = self.db.begin_read()?;
        let root = rtx.open_table(ROOT)?;
        let raw = root
            .get(K_PRIVATE_KEY)?
            .ok_or_else(|| Error::Db("missing signing key".to_owned()))?;
        let seed: [u8; 32] = raw
            .value()
            .try_into()
            .map_err(|_| Error::Db("signing key has wrong length".to_owned()))?;
        Ok(SigningKey::from_bytes(&seed))
    }

    pub fn cookie_secret(&self) -> Result<[u8; 32], Error> {
        let rtx = self.db.begin_read()?;
        let root = rtx.open_table(ROOT)?;
        let raw = root
            .get(K_COOKIE_SECRET)?
            .ok_or_else(|| Error::Db("missing cookie secret".to_owned()))?;
        raw.value()
            .try_into()
            .map_err(|_| Error::Db("cookie secret has wrong length".to_owned()))
    }

    /// Consistent snapshot of the whole database file. Writers are
    /// quiesced while the file is read, so the copy always reflects the
    /// most recent commit.
    pub fn backup_bytes(&self) -> Result<Vec<u8>, Error> {
        let _guard = self.tickets_lock.write();
        Ok(std::fs::read(&self.path)?)
    }
}

impl crate::addrgen::IndexStore for Store {
    fn set_last_addr_index(&self, xpub_id: u32, idx: u32) -> Result<(), Error> {
        Store::set_last_addr_index(self, xpub_id, idx)
    }
}

const TICKET_FIELDS: [&str; 16] = [
    F_COMMITMENT_ADDRESS,
    F_PURCHASE_HEIGHT,
    F_FEE_ADDRESS_XPUB_ID,
    F_FEE_ADDRESS_INDEX,
    F_FEE_ADDRESS,
    F_FEE_AMOUNT,
    F_FEE_EXPIRATION,
    F_FEE_TX_HEX,
    F_FEE_TX_HASH,
    F_FEE_TX_STATUS,
    F_VOTING_WIF,
    F_CONFIRMED,
    F_VOTE_CHOICES,
    F_TSPEND_POLICY,
    F_TREASURY_POLICY,
    F_OUTCOME,
];

fn write_ticket(
    table: &mut redb::Table<(&'static str, &'static str), &'static [u8]>,
    t: &Ticket,
) -> Result<(), Error> {
    let h = t.hash.as_str();
    table.insert((h, F_COMMITMENT_ADDRESS), t.commitment_address.as_bytes())?;
    table.insert((h, F_PURCHASE_HEIGHT), t.purchase_height.to_le_bytes().as_slice())?;
    table.insert(
        (h, F_FEE_ADDRESS_XPUB_ID),
        t.fee_address_xpub_id.to_le_bytes().as_slice(),
    )?;
    table.insert(
        (h, F_FEE_ADDRESS_INDEX),
        t.fee_address_index.to_le_bytes().as_slice(),
    )?;
    table.insert((h, F_FEE_ADDRESS), t.fee_address.as_bytes())?;
    table.insert((h, F_FEE_AMOUNT), t.fee_amount.to_le_bytes().as_slice())?;
    table.insert((h, F_FEE_EXPIRATION), t.fee_expiration.to_le_bytes().as_slice())?;
    table.insert((h, F_FEE_TX_HEX), t.fee_tx_hex.as_bytes())?;
    table.insert((h, F_FEE_TX_HASH), t.fee_tx_hash.as_bytes())?;
    table.insert((h, F_FEE_TX_STATUS), t.fee_tx_status.to_string().as_bytes())?;
    table.insert((h, F_VOTING_WIF), t.voting_wif.as_bytes())?;
    table.insert((h, F_CONFIRMED), [t.confirmed as u8].as_slice())?;
    table.insert((h, F_VOTE_CHOICES), encode_map(&t.vote_choices)?.as_slice())?;
    table.insert((h, F_TSPEND_POLICY), encode_map(&t.tspend_policy)?.as_slice())?;
    table.insert(
        (h, F_TREASURY_POLICY),
        encode_map(&t.treasury_policy)?.as_slice(),
    )?;
    table.insert((h, F_OUTCOME), t.outcome.to_string().as_bytes())?;
    Ok(())
}

fn read_ticket<T>(table: &T, hash: &str) -> Result<Option<Ticket>, Error>
where
    T: ReadableTable<(&'static str, &'static str), &'static [u8]>,
{
    if table.get((hash, F_FEE_TX_STATUS))?.is_none() {
        return Ok(None);
    }
    let mut fields: HashMap<String, Vec<u8>> = HashMap::new();
    for field in TICKET_FIELDS {
        if let Some(raw) = table.get((hash, field))? {
            fields.insert(field.to_owned(), raw.value().to_vec());
        }
    }
    Ok(Some(ticket_from_fields(hash.to_owned(), fields)?))
}

// Field keys are sorted, so all fields of one hash are contiguous in the
// table and tickets can be assembled in a single pass.
fn collect_tickets<T>(table: &T) -> Result<Vec<Ticket>, Error>
where
    T: ReadableTable<(&'static str, &'static str), &'static [u8]>,
{
    let mut tickets = Vec::new();
    let mut current: Option<(String, HashMap<String, Vec<u8>>)> = None;
    for entry in table.iter()? {
        let (k, v) = entry?;
        let (hash, field) = k.value();
        let same_ticket = matches!(&current, Some((h, _)) if h.as_str() == hash);
        if !same_ticket {
            if let Some((h, fields)) = current.take() {
                tickets.push(ticket_from_fields(h, fields)?);
            }
            current = Some((hash.to_owned(), HashMap::new()));
        }
        if let Some((_, fields)) = current.as_mut() {
            fields.insert(field.to_owned(), v.value().to_vec());
        }
    }
    if let Some((h, fields)) = current.take() {
        tickets.push(ticket_from_fields(h, fields)?);
    }
    Ok(tickets)
}

fn ticket_from_fields(hash: String, mut f: HashMap<String, Vec<u8>>) -> Result<Ticket, Error> {
    let status_raw = decode_string(f.remove(F_FEE_TX_STATUS))?;
    let fee_tx_status = FeeStatus::from_str(&status_raw)
        .map_err(|_| Error::Db(format!("unknown fee status {:?}", status_raw)))?;
    let outcome_raw = decode_string(f.remove(F_OUTCOME))?;
    let outcome = TicketOutcome::from_str(&outcome_raw)
        .map_err(|_| Error::Db(format!("unknown outcome {:?}", outcome_raw)))?;
    Ok(Ticket {
        hash,
        commitment_address: decode_string(f.remove(F_COMMITMENT_ADDRESS))?,
        purchase_height: decode_i64(f.remove(F_PURCHASE_HEIGHT))?,
        fee_address_xpub_id: decode_u32(f.remove(F_FEE_ADDRESS_XPUB_ID))?,
        fee_address_index: decode_u32(f.remove(F_FEE_ADDRESS_INDEX))?,
        fee_address: decode_string(f.remove(F_FEE_ADDRESS))?,
        fee_amount: decode_i64(f.remove(F_FEE_AMOUNT))?,
        fee_expiration: decode_i64(f.remove(F_FEE_EXPIRATION))?,
        fee_tx_hex: decode_string(f.remove(F_FEE_TX_HEX))?,
        fee_tx_hash: decode_string(f.remove(F_FEE_TX_HASH))?,
        fee_tx_status,
        voting_wif: decode_string(f.remove(F_VOTING_WIF))?,
        confirmed: decode_bool(f.remove(F_CONFIRMED)),
        vote_choices: decode_map(f.remove(F_VOTE_CHOICES))?,
        tspend_policy: decode_map(f.remove(F_TSPEND_POLICY))?,
        treasury_policy: decode_map(f.remove(F_TREASURY_POLICY))?,
        outcome,
    })
}

// Absent keys decode to the zero value of their type.

fn decode_string(raw: Option<Vec<u8>>) -> Result<String, Error> {
    match raw {
        None => Ok(String::new()),
        Some(b) => String::from_utf8(b).map_err(|e| Error::Db(format!("invalid string: {}", e))),
    }
}

fn decode_u32(raw: Option<Vec<u8>>) -> Result<u32, Error> {
    match raw {
        None => Ok(0),
        Some(b) => {
            let arr: [u8; 4] = b
                .as_slice()
                .try_into()
                .map_err(|_| Error::Db("expected 4 byte integer".to_owned()))?;
            Ok(u32::from_le_bytes(arr))
        }
    }
}

fn decode_i64(raw: Option<Vec<u8>>) -> Result<i64, Error> {
    match raw {
        None => Ok(0),
        Some(b) => {
            let arr: [u8; 8] = b
                .as_slice()
                .try_into()
                .map_err(|_| Error::Db("expected 8 byte integer".to_owned()))?;
            Ok(i64::from_le_bytes(arr))
        }
    }
}

fn decode_bool(raw: Option<Vec<u8>>) -> bool {
    matches!(raw.as_deref(), Some([b]) if *b != 0)
}

fn encode_map(map: &HashMap<String, String>) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(map).map_err(|e| Error::Db(format!("cannot encode map: {}", e)))
}

// JSON null, the empty object and a missing key all decode to an empty
// map; anything else malformed is an error.
fn decode_map(raw: Option<Vec<u8>>) -> Result<HashMap<String, String>, Error> {
    match raw {
        None => Ok(HashMap::new()),
        Some(b) if b.is_empty() => Ok(HashMap::new()),
        Some(b) => {
            let parsed: Option<HashMap<String, String>> = serde_json::from_slice(&b)
                .map_err(|e| Error::Db(format!("cannot decode map: {}", e)))?;
            Ok(parsed.unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        Store::open(dir.path().join("vspd.db"), DEFAULT_MAX_VOTE_CHANGES).unwrap()
    }

    fn ticket(hash: &str) -> Ticket {
        Ticket {
            hash: hash.to_owned(),
            commitment_address: "DsCommitment".to_owned(),
            fee_address: "DsFee".to_owned(),
            fee_amount: 100_000,
            fee_expiration: 1_590_563_759,
            ..Ticket::default()
        }
    }

    #[test]
    fn fresh_database_is_initialized_once() {
        let dir = TempDir::new().unwrap();
        let (secret, pubkey) = {
            let store = open_store(&dir);
            assert_eq!(store.version().unwrap(), LATEST_VERSION);
            (
                store.cookie_secret().unwrap(),
                store.signing_key().unwrap().verifying_key(),
            )
        };
        // Keys survive a reopen unchanged.
        let store = open_store(&dir);
        assert_eq!(store.cookie_secret().unwrap(), secret);
        assert_eq!(store.signing_key().unwrap().verifying_key(), pubkey);
    }

    #[test]
    fn ticket_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut t = ticket(&"ab".repeat(32));
        t.vote_choices.insert("treasury".to_owned(), "yes".to_owned());
        store.insert_new_ticket(&t).unwrap();

        let fetched = store.get_ticket(&t.hash).unwrap().unwrap();
        assert_eq!(fetched, t);
        assert!(store.get_ticket(&"00".repeat(32)).unwrap().is_none());

        // Duplicate insert fails.
        assert!(store.insert_new_ticket(&t).is_err());
        // Empty hash fails.
        assert!(store.insert_new_ticket(&Ticket::default()).is_err());

        t.fee_tx_status = FeeStatus::Received;
        t.voting_wif = "PrivKey".to_owned();
        store.update_ticket(&t).unwrap();
        assert_eq!(store.get_ticket(&t.hash).unwrap().unwrap(), t);

        // Updating an unknown ticket fails.
        let ghost = ticket(&"cd".repeat(32));
        assert!(store.update_ticket(&ghost).is_err());

        store.delete_ticket(&t.hash).unwrap();
        assert!(store.get_ticket(&t.hash).unwrap().is_none());
        assert!(store.delete_ticket(&t.hash).is_err());
    }

    #[test]
    fn filters_and_counts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut unconfirmed = ticket(&"01".repeat(32));
        unconfirmed.confirmed = false;
        store.insert_new_ticket(&unconfirmed).unwrap();

        let mut pending = ticket(&"02".repeat(32));
        pending.confirmed = true;
        pending.purchase_height = 100;
        pending.fee_tx_status = FeeStatus::Received;
        store.insert_new_ticket(&pending).unwrap();

        let mut broadcast = ticket(&"03".repeat(32));
        broadcast.confirmed = true;
        broadcast.purchase_height = 101;
        broadcast.fee_tx_status = FeeStatus::Broadcast;
        store.insert_new_ticket(&broadcast).unwrap();

        let mut votable = ticket(&"04".repeat(32));
        votable.confirmed = true;
        votable.fee_tx_status = FeeStatus::Confirmed;
        store.insert_new_ticket(&votable).unwrap();

        let mut voted = ticket(&"05".repeat(32));
        voted.confirmed = true;
        voted.purchase_height = 102;
        voted.fee_tx_status = FeeStatus::Confirmed;
        voted.outcome = TicketOutcome::Voted;
        store.insert_new_ticket(&voted).unwrap();

        let mut revoked = ticket(&"06".repeat(32));
        revoked.confirmed = true;
        revoked.purchase_height = 103;
        revoked.fee_tx_status = FeeStatus::Confirmed;
        revoked.outcome = TicketOutcome::Revoked;
        store.insert_new_ticket(&revoked).unwrap();

        let hashes = |ts: Vec<Ticket>| -> Vec<String> { ts.into_iter().map(|t| t.hash).collect() };

        assert_eq!(hashes(store.unconfirmed_tickets().unwrap()), vec![unconfirmed.hash.clone()]);
        assert_eq!(hashes(store.pending_fees().unwrap()), vec![pending.hash.clone()]);
        assert_eq!(hashes(store.unconfirmed_fees().unwrap()), vec![broadcast.hash.clone()]);
        assert_eq!(hashes(store.votable_tickets().unwrap()), vec![votable.hash.clone()]);
        assert_eq!(hashes(store.voted_tickets().unwrap()), vec![voted.hash.clone()]);
        // The votable ticket above has no purchase height recorded.
        assert_eq!(
            hashes(store.missing_purchase_height().unwrap()),
            vec![votable.hash.clone()]
        );

        assert_eq!(store.count_tickets().unwrap(), (1, 1, 1));
        assert_eq!(store.all_tickets().unwrap().len(), 6);
    }

    #[test]
    fn vote_change_log_is_bounded() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("vspd.db"), 3).unwrap();
        let hash = "aa".repeat(32);

        let record = |n: u32| VoteChangeRecord {
            request: format!("req-{}", n),
            request_signature: "rsig".to_owned(),
            response: format!("resp-{}", n),
            response_signature: "ssig".to_owned(),
        };

        for n in 0..5 {
            store.save_vote_change(&hash, &record(n)).unwrap();
        }
        let changes = store.vote_changes(&hash).unwrap();
        assert_eq!(changes.len(), 3);
        // Oldest evicted, indices keep increasing.
        assert_eq!(changes[0].0, 2);
        assert_eq!(changes[0].1.request, "req-2");
        assert_eq!(changes[2].0, 4);
        assert_eq!(changes[2].1.request, "req-4");
    }

    #[test]
    fn alt_sign_addr_is_immutable() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let hash = "bb".repeat(32);
        let record = AltSignAddrRecord {
            alt_sign_addr: "DsAlt".to_owned(),
            req: "{}".to_owned(),
            req_sig: "rsig".to_owned(),
            resp: "{}".to_owned(),
            resp_sig: "ssig".to_owned(),
        };

        assert!(store.alt_sign_addr(&hash).unwrap().is_none());
        store.insert_alt_sign_addr(&hash, &record).unwrap();
        assert_eq!(store.alt_sign_addr(&hash).unwrap().unwrap(), record);
        assert!(store.insert_alt_sign_addr(&hash, &record).is_err());
    }

    #[test]
    fn xpub_retirement() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let first = store.upsert_fee_xpub("xpub-one", 1000).unwrap();
        assert_eq!(first.id, 0);
        assert_eq!(first.last_used_idx, 0);
        assert_eq!(first.retired, 0);

        store.set_last_addr_index(0, 41).unwrap();
        // Same key is a no-op, index untouched.
        let same = store.upsert_fee_xpub("xpub-one", 2000).unwrap();
        assert_eq!(same.id, 0);
        assert_eq!(store.fee_xpub().unwrap().last_used_idx, 41);

        // New key retires the old record and starts from index zero.
        let second = store.upsert_fee_xpub("xpub-two", 3000).unwrap();
        assert_eq!(second.id, 1);
        assert_eq!(second.last_used_idx, 0);
        let all = store.all_fee_xpubs().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].retired, 3000);
        assert_eq!(all[1].retired, 0);
        assert_eq!(store.fee_xpub().unwrap().id, 1);

        // A previously used key may never come back.
        assert!(store.upsert_fee_xpub("xpub-one", 4000).is_err());
    }

    #[test]
    fn migrates_v1_database_to_latest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vspd.db");

        let confirmed_hash = "aa".repeat(32);
        let received_hash = "bb".repeat(32);
        {
            let db = Database::create(&path).unwrap();
            let wtx = db.begin_write().unwrap();
            {
                let mut root = wtx.open_table(ROOT).unwrap();
                root.insert(K_VERSION, 1u32.to_le_bytes().as_slice()).unwrap();
                root.insert(K_FEE_XPUB, "legacy-xpub".as_bytes()).unwrap();
                root.insert(K_LAST_ADDR_INDEX, 7u32.to_le_bytes().as_slice())
                    .unwrap();

                let mut tickets = wtx.open_table(TICKETS_V1).unwrap();
                let mut confirmed = ticket(&confirmed_hash);
                confirmed.fee_tx_status = FeeStatus::Confirmed;
                confirmed.fee_tx_hex = "deadbeef".to_owned();
                confirmed.confirmed = true;
                tickets
                    .insert(
                        confirmed_hash.as_str(),
                        serde_json::to_vec(&confirmed).unwrap().as_slice(),
                    )
                    .unwrap();

                let mut received = ticket(&received_hash);
                received.fee_tx_status = FeeStatus::Received;
                received.fee_tx_hex = "cafe".to_owned();
                tickets
                    .insert(
                        received_hash.as_str(),
                        serde_json::to_vec(&received).unwrap().as_slice(),
                    )
                    .unwrap();
            }
            wtx.commit().unwrap();
        }

        let store = Store::open(&path, DEFAULT_MAX_VOTE_CHANGES).unwrap();
        assert_eq!(store.version().unwrap(), LATEST_VERSION);

        // Confirmed fee hex was reclaimed, unconfirmed kept.
        let confirmed = store.get_ticket(&confirmed_hash).unwrap().unwrap();
        assert_eq!(confirmed.fee_tx_hex, "");
        assert_eq!(confirmed.fee_tx_status, FeeStatus::Confirmed);
        let received = store.get_ticket(&received_hash).unwrap().unwrap();
        assert_eq!(received.fee_tx_hex, "cafe");

        // Both tickets now point at xpub record zero.
        assert_eq!(confirmed.fee_address_xpub_id, 0);
        assert_eq!(received.fee_address_xpub_id, 0);
        let xpub = store.fee_xpub().unwrap();
        assert_eq!(xpub.id, 0);
        assert_eq!(xpub.key, "legacy-xpub");
        assert_eq!(xpub.last_used_idx, 7);

        // The alt-sign-addr table exists and accepts inserts.
        let record = AltSignAddrRecord {
            alt_sign_addr: "DsAlt".to_owned(),
            req: "{}".to_owned(),
            req_sig: "r".to_owned(),
            resp: "{}".to_owned(),
            resp_sig: "s".to_owned(),
        };
        store.insert_alt_sign_addr(&confirmed_hash, &record).unwrap();
    }

    #[test]
    fn refuses_newer_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vspd.db");
        {
            let db = Database::create(&path).unwrap();
            let wtx = db.begin_write().unwrap();
            {
                let mut root = wtx.open_table(ROOT).unwrap();
                root.insert(K_VERSION, (LATEST_VERSION + 1).to_le_bytes().as_slice())
                    .unwrap();
            }
            wtx.commit().unwrap();
        }
        assert!(Store::open(&path, DEFAULT_MAX_VOTE_CHANGES).is_err());
    }

    #[test]
    fn backup_restores_identically() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut t = ticket(&"ee".repeat(32));
        t.confirmed = true;
        t.fee_tx_status = FeeStatus::Confirmed;
        store.insert_new_ticket(&t).unwrap();

        let snapshot = store.backup_bytes().unwrap();
        assert!(!snapshot.is_empty());

        let restored_path = dir.path().join("restored.db");
        std::fs::write(&restored_path, &snapshot).unwrap();
        let restored = Store::open(&restored_path, DEFAULT_MAX_VOTE_CHANGES).unwrap();
        assert_eq!(restored.all_tickets().unwrap(), store.all_tickets().unwrap());
        assert_eq!(restored.count_tickets().unwrap(), store.count_tickets().unwrap());
        assert_eq!(
            restored.signing_key().unwrap().to_bytes(),
            store.signing_key().unwrap().to_bytes()
        );
    }

    #[test]
    fn map_decoding_edge_cases() {
        assert!(decode_map(None).unwrap().is_empty());
        assert!(decode_map(Some(b"null".to_vec())).unwrap().is_empty());
        assert!(decode_map(Some(b"{}".to_vec())).unwrap().is_empty());
        assert!(decode_map(Some(Vec::new())).unwrap().is_empty());
        let m = decode_map(Some(b"{\"a\":\"b\"}".to_vec())).unwrap();
        assert_eq!(m.get("a").map(String::as_str), Some("b"));
        assert!(decode_map(Some(b"[1,2]".to_vec())).is_err());
        assert!(decode_map(Some(b"garbage".to_vec())).is_err());
    }
}
