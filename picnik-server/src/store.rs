use std::path::Path;

use picnik_common::documents::{decode, encode, upgrade, Versioned};
use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Tree};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};

pub const USERS: &str = "users";
pub const FRIEND_REQUESTS: &str = "friendRequests";
pub const PENDING_PAIRS: &str = "pendingRequestPairs";
pub const PICNICS: &str = "picnics";
pub const NOTIFICATIONS: &str = "notifications";
pub const CREDENTIALS: &str = "credentials";
pub const SESSIONS: &str = "sessions";
pub const PASSWORD_RESETS: &str = "passwordResets";
pub const PUSH_TOKENS: &str = "pushTokens";

pub fn saved_restaurants(user: impl AsRef<str>) -> String {
    format!("{USERS}/{}/savedRestaurants", user.as_ref())
}

pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// Every document lives in one tree, so any set of them can share a transaction.
fn key(collection: &str, id: &str) -> Result<String> {
    if id.is_empty() || id.contains('/') {
        return Err(AppError::InvalidOperation(format!("invalid document id {id:?}")));
    }
    Ok(format!("{collection}/{id}"))
}

/// Field predicates evaluated against the raw JSON document.
#[derive(Clone, Debug)]
pub enum Filter {
    All,
    Eq(&'static str, Value),
    ArrayContains(&'static str, Value),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &'static str, value: impl Into<Value>) -> Self {
        Filter::Eq(field, value.into())
    }
    pub fn array_contains(field: &'static str, value: impl Into<Value>) -> Self {
        Filter::ArrayContains(field, value.into())
    }

    fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => doc.get(field) == Some(value),
            Filter::ArrayContains(field, value) => doc
                .get(field)
                .and_then(Value::as_array)
                .map_or(false, |items| items.contains(value)),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }
}

#[derive(Clone)]
pub struct Store {
    db: Db,
    docs: Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let docs = db.open_tree("documents")?;
        Ok(Self { db, docs })
    }

    pub fn get<T: Versioned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        match self.docs.get(key(collection, id)?)? {
            Some(bytes) => Ok(Some(decode(serde_json::from_slice(&bytes)?)?)),
            None => Ok(None),
        }
    }

    /// Like [`Store::get`] but a missing document is `NotFound`.
    pub fn require<T: Versioned>(&self, collection: &str, id: &str, what: &str) -> Result<T> {
        self.get(collection, id)?
            .ok_or_else(|| AppError::NotFound(format!("{what} {id}")))
    }

    pub fn set<T: Versioned>(&self, collection: &str, id: &str, doc: &T) -> Result<()> {
        self.docs
            .insert(key(collection, id)?, serde_json::to_vec(&encode(doc)?)?)?;
        Ok(())
    }

    /// Read-modify-write of one document inside a transaction.
    pub fn update<T, F>(&self, collection: &str, id: &str, what: &str, func: F) -> Result<T>
    where
        T: Versioned,
        F: Fn(&mut T) -> Result<()>,
    {
        self.transaction(|tx| {
            let mut doc: T = tx.require(collection, id, what)?;
            func(&mut doc).map_err(ConflictableTransactionError::Abort)?;
            tx.set(collection, id, &doc)?;
            Ok(doc)
        })
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self.docs.remove(key(collection, id)?)?.is_some())
    }

    pub fn query<T: Versioned>(&self, collection: &str, filter: &Filter) -> Result<Vec<T>> {
        Ok(self
            .query_with_ids(collection, filter)?
            .into_iter()
            .map(|(_, doc)| doc)
            .collect())
    }

    /// Matching documents of `collection` together with their ids.
    pub fn query_with_ids<T: Versioned>(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<(String, T)>> {
        let prefix = format!("{collection}/");
        let mut out = Vec::new();
        for entry in self.docs.scan_prefix(prefix.as_bytes()) {
            let (k, bytes) = entry?;
            let id = &k[prefix.len()..];
            // Skip documents of nested subcollections.
            if id.contains(&b'/') {
                continue;
            }
            let value = upgrade::<T>(serde_json::from_slice(&bytes)?)?;
            if filter.matches(&value) {
                out.push((String::from_utf8_lossy(id).into_owned(), serde_json::from_value(value)?));
            }
        }
        Ok(out)
    }

    pub fn find_one<T: Versioned>(&self, collection: &str, filter: &Filter) -> Result<Option<T>> {
        Ok(self.query(collection, filter)?.into_iter().next())
    }

    /// Runs `f` atomically. The closure may be re-run on conflict, so it must
    /// not have side effects outside the transaction.
    pub fn transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: Fn(&Tx<'_>) -> TxResult<R>,
    {
        self.docs
            .transaction(|tree| f(&Tx { tree }))
            .map_err(|err| match err {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => AppError::Storage(err.to_string()),
            })
    }

    /// Standing query: sends the full result set now and again after every
    /// change under `collection`. Dropping the subscription stops it.
    pub fn subscribe<T>(&self, collection: &str, filter: Filter) -> Subscription<T>
    where
        T: Versioned + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let collection = collection.to_string();
        let mut events = Box::pin(self.docs.watch_prefix(format!("{collection}/").as_bytes()));
        let store = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match store.query::<T>(&collection, &filter) {
                    Ok(snapshot) => {
                        if tx.send(snapshot).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("subscription on {collection} stopped: {err}");
                        break;
                    }
                }
                if events.as_mut().await.is_none() {
                    break;
                }
            }
            debug!("subscription on {collection} closed");
        });
        Subscription { rx, task }
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

pub type TxResult<T> = std::result::Result<T, ConflictableTransactionError<AppError>>;

pub fn abort<T>(err: AppError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

fn aborting(err: impl Into<AppError>) -> ConflictableTransactionError<AppError> {
    ConflictableTransactionError::Abort(err.into())
}

pub struct Tx<'a> {
    tree: &'a TransactionalTree,
}

impl Tx<'_> {
    pub fn get<T: Versioned>(&self, collection: &str, id: &str) -> TxResult<Option<T>> {
        let key = key(collection, id).map_err(aborting)?;
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => {
                let value: Value = serde_json::from_slice(&bytes).map_err(aborting)?;
                Ok(Some(decode(value).map_err(aborting)?))
            }
            None => Ok(None),
        }
    }

    pub fn require<T: Versioned>(&self, collection: &str, id: &str, what: &str) -> TxResult<T> {
        match self.get(collection, id)? {
            Some(doc) => Ok(doc),
            None => abort(AppError::NotFound(format!("{what} {id}"))),
        }
    }

    pub fn set<T: Versioned>(&self, collection: &str, id: &str, doc: &T) -> TxResult<()> {
        let key = key(collection, id).map_err(aborting)?;
        let value = encode(doc).map_err(aborting)?;
        let bytes = serde_json::to_vec(&value).map_err(aborting)?;
        self.tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn delete(&self, collection: &str, id: &str) -> TxResult<bool> {
        let key = key(collection, id).map_err(aborting)?;
        Ok(self.tree.remove(key.as_bytes())?.is_some())
    }
}

pub struct Subscription<T> {
    rx: mpsc::Receiver<Vec<T>>,
    task: JoinHandle<()>,
}

impl<T> Subscription<T> {
    /// Next full snapshot, or `None` once the subscription has stopped.
    pub async fn next(&mut self) -> Option<Vec<T>> {
        self.rx.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use picnik_common::documents::SavedRestaurant;
    use picnik_common::documents::User;
    use picnik_common::{PlaceId, UserId};

    use super::*;

    fn store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Store::open(dir.path()).unwrap(), dir)
    }

    fn user(id: &str, email: &str) -> User {
        User::new(UserId(id.into()), id, email)
    }

    #[test]
    fn query_matches_fields_and_skips_subcollections() {
        let (store, _dir) = store();
        store.set(USERS, "u1", &user("u1", "a@x.com")).unwrap();
        store.set(USERS, "u2", &user("u2", "b@x.com")).unwrap();
        let saved = SavedRestaurant {
            place_id: PlaceId("p1".into()),
            name: "Noodles".into(),
            address: "1 Main St".into(),
            rating: None,
            price_level: None,
            photo_url: None,
            saved_at: chrono::Utc::now(),
        };
        store.set(&saved_restaurants("u1"), "p1", &saved).unwrap();

        let all: Vec<User> = store.query(USERS, &Filter::All).unwrap();
        assert_eq!(all.len(), 2);
        let found: Option<User> = store.find_one(USERS, &Filter::eq("email", "b@x.com")).unwrap();
        assert_eq!(found.unwrap().id, UserId("u2".into()));
        let nested: Vec<SavedRestaurant> =
            store.query(&saved_restaurants("u1"), &Filter::All).unwrap();
        assert_eq!(nested, vec![saved]);
    }

    #[test]
    fn aborted_transaction_writes_nothing() {
        let (store, _dir) = store();
        let result: Result<()> = store.transaction(|tx| {
            tx.set(USERS, "u1", &user("u1", "a@x.com"))?;
            abort(AppError::InvalidOperation("nope".into()))
        });
        assert!(matches!(result, Err(AppError::InvalidOperation(_))));
        assert!(store.get::<User>(USERS, "u1").unwrap().is_none());
    }

    #[test]
    fn update_requires_existing_document() {
        let (store, _dir) = store();
        let err = store
            .update::<User, _>(USERS, "ghost", "user", |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(matches!(
            store.get::<User>(USERS, "a/b"),
            Err(AppError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn subscription_delivers_fresh_snapshots() {
        let (store, _dir) = store();
        let mut sub = store.subscribe::<User>(USERS, Filter::eq("email", "a@x.com"));
        assert_eq!(sub.next().await.unwrap().len(), 0);

        store.set(USERS, "u1", &user("u1", "a@x.com")).unwrap();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.len(), 1);
    }
}
