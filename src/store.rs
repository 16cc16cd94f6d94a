//! Durable request records.
//!
//! Two sled trees: `requests` holds the current CBOR snapshot per id, and
//! `revisions` keeps every committed snapshot under `{id}/{version}` so the
//! full sequence of states stays readable after later transitions.
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{IVec, Tree};

use crate::error::{Result, WorkflowError};
use crate::request::Request;

const REQUESTS_TREE: &str = "requests";
const REVISIONS_TREE: &str = "revisions";

/// A snapshot together with the exact bytes it was read from. The bytes are
/// the compare-and-swap token for the next commit.
#[derive(Debug, Clone)]
pub struct Stored {
    bytes: IVec,
    pub request: Request,
}

pub struct RequestStore {
    requests: Tree,
    revisions: Tree,
}

impl RequestStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            requests: db.open_tree(REQUESTS_TREE)?,
            revisions: db.open_tree(REVISIONS_TREE)?,
        })
    }

    pub fn load(&self, id: &str) -> Result<Option<Stored>> {
        match self.requests.get(id.as_bytes())? {
            Some(bytes) => {
                let request = Request::decode(&bytes)?;
                Ok(Some(Stored { bytes, request }))
            }
            None => Ok(None),
        }
    }

    /// Persist a newly created request. Fails if the id is taken.
    pub fn insert_new(&self, request: &Request) -> Result<()> {
        let (_, cbor) = request.encode()?;
        let key = request.id().as_bytes();
        let revision = revision_key(request.id(), request.version());

        let result = (&self.requests, &self.revisions).transaction(|(requests, revisions)| {
            if let Some(existing) = requests.get(key)? {
                return Err(ConflictableTransactionError::Abort(version_of(&existing)));
            }
            requests.insert(key, cbor.as_slice())?;
            revisions.insert(revision.as_bytes(), cbor.as_slice())?;
            Ok(())
        });

        self.finish(result, request.id(), 0)?;
        self.requests.flush()?;
        Ok(())
    }

    /// Replace `previous` with `next` if nobody committed in between.
    pub fn commit(&self, previous: &Stored, next: &Request) -> Result<()> {
        let (_, cbor) = next.encode()?;
        let key = next.id().as_bytes();
        let revision = revision_key(next.id(), next.version());

        let result = (&self.requests, &self.revisions).transaction(|(requests, revisions)| {
            let current = requests.get(key)?;
            if current.as_ref() != Some(&previous.bytes) {
                let actual = current.as_ref().map(version_of).unwrap_or(0);
                return Err(ConflictableTransactionError::Abort(actual));
            }
            requests.insert(key, cbor.as_slice())?;
            revisions.insert(revision.as_bytes(), cbor.as_slice())?;
            Ok(())
        });

        self.finish(result, next.id(), previous.request.version())?;
        self.requests.flush()?;
        Ok(())
    }

    fn finish(
        &self,
        result: std::result::Result<(), TransactionError<u64>>,
        id: &str,
        expected: u64,
    ) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(actual)) => Err(WorkflowError::ConcurrentModification {
                id: id.to_string(),
                expected,
                actual,
            }),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    pub fn revision(&self, id: &str, version: u64) -> Result<Option<Request>> {
        self.revisions
            .get(revision_key(id, version).as_bytes())?
            .map(|bytes| Request::decode(&bytes))
            .transpose()
    }

    /// Every committed snapshot of `id`, oldest first.
    pub fn revisions(&self, id: &str) -> Result<Vec<Request>> {
        self.revisions
            .scan_prefix(format!("{id}/").as_bytes())
            .map(|entry| {
                let (_, bytes) = entry?;
                Request::decode(&bytes)
            })
            .collect()
    }

    /// Current snapshot of every request.
    pub fn scan(&self) -> Result<Vec<Request>> {
        self.requests
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                Request::decode(&bytes)
            })
            .collect()
    }
}

// zero padded so lexical order is version order
fn revision_key(id: &str, version: u64) -> String {
    format!("{id}/{version:020}")
}

fn version_of(bytes: &IVec) -> u64 {
    Request::decode(bytes).map(|r| r.version()).unwrap_or(0)
}
