use std::ops::Deref;

use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

/// Shared handle to the SurrealDB connection behind both the raw chunk store
/// and the analysis corpus.
#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// Connects to `address`, signs in as root, and pins every subsequent
    /// query to the given namespace and database.
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let client = connect(address).await?;
        client.signin(Root { username, password }).await?;
        client.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client })
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// In-memory engine with no credentials. Tests get an isolated store by
    /// passing a fresh database name.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let client = connect("mem://").await?;
        client.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client })
    }
}
