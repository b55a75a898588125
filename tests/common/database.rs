//! Throwaway databases on a local PostgreSQL
//!
//! [`TestDatabase::spawn`] returns `None` unless `E2E_LOCAL_PG_HOST` is
//! set, so tests built on it skip themselves elsewhere. Port, user and
//! password come from `E2E_LOCAL_PG_PORT` (5432), `E2E_LOCAL_PG_USER`
//! (postgres) and `E2E_LOCAL_PG_PASSWORD` (postgres). The user must be
//! allowed to create databases and roles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_postgres::{Client, NoTls};
use uuid::Uuid;

use postgres_e2e::probe::sql::quote_identifier;
use postgres_e2e::{PollSpec, VerifierConfig};

use super::fixtures::config_with;

/// Setting this enables the local PostgreSQL tests
pub const LOCAL_PG_HOST: &str = "E2E_LOCAL_PG_HOST";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// A uniquely named database, dropped by `cleanup` together with any
/// roles created for it
pub struct TestDatabase {
    pub name: String,
    pub addr: SocketAddr,
    pub user: String,
    pub password: String,
    roles: Vec<String>,
}

impl TestDatabase {
    pub async fn spawn() -> Option<Self> {
        let Ok(host) = std::env::var(LOCAL_PG_HOST) else {
            eprintln!("{} is not set, skipping local PostgreSQL test", LOCAL_PG_HOST);
            return None;
        };
        let port: u16 = env_or("E2E_LOCAL_PG_PORT", "5432")
            .parse()
            .expect("E2E_LOCAL_PG_PORT must be a port number");
        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .expect("Failed to resolve local PostgreSQL host")
            .next()
            .expect("Local PostgreSQL host has no address");

        let database = Self {
            name: format!("e2e_{}", Uuid::new_v4().simple()),
            addr,
            user: env_or("E2E_LOCAL_PG_USER", "postgres"),
            password: env_or("E2E_LOCAL_PG_PASSWORD", "postgres"),
            roles: Vec::new(),
        };

        database
            .connect("postgres")
            .await
            .batch_execute(&format!("CREATE DATABASE {}", quote_identifier(&database.name)))
            .await
            .expect("Failed to create database");
        tracing::info!("Created test database: {}", database.name);

        Some(database)
    }

    /// Superuser connection to the test database
    pub async fn client(&self) -> Client {
        self.connect(&self.name).await
    }

    /// Create a non-superuser login role that may create schemas in the
    /// test database; returns its name
    pub async fn create_login_role(&mut self, password: &str) -> String {
        let role = format!("e2e_owner_{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.client()
            .await
            .batch_execute(&format!(
                "CREATE ROLE {role} LOGIN PASSWORD '{password}'; \
                 GRANT CREATE ON DATABASE {db} TO {role};",
                role = quote_identifier(&role),
                db = quote_identifier(&self.name),
            ))
            .await
            .expect("Failed to create role");
        self.roles.push(role.clone());
        role
    }

    /// Number of tables `schema` holds, as the superuser sees it
    pub async fn table_count(&self, schema: &str) -> i64 {
        self.client()
            .await
            .query_one(
                "SELECT count(*) FROM information_schema.tables WHERE table_schema = $1",
                &[&schema],
            )
            .await
            .expect("Failed to count tables")
            .get(0)
    }

    /// Terminate remaining sessions, then drop the database and its roles
    pub async fn cleanup(self) {
        let client = self.connect("postgres").await;
        client
            .execute(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = $1 AND pid <> pg_backend_pid()",
                &[&self.name],
            )
            .await
            .expect("Failed to terminate database connections");
        client
            .batch_execute(&format!(
                "DROP DATABASE IF EXISTS {}",
                quote_identifier(&self.name)
            ))
            .await
            .expect("Failed to drop database");
        for role in &self.roles {
            client
                .batch_execute(&format!("DROP ROLE IF EXISTS {}", quote_identifier(role)))
                .await
                .expect("Failed to drop role");
        }
    }

    async fn connect(&self, dbname: &str) -> Client {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.addr.ip().to_string())
            .port(self.addr.port())
            .user(&self.user)
            .password(&self.password)
            .dbname(dbname);
        let (client, connection) = config
            .connect(NoTls)
            .await
            .expect("Failed to connect to Postgres");

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::info!("connection error: {e}");
            }
        });

        client
    }
}

/// Config connecting sessions to `database` as its superuser.
///
/// Polls retry quickly but leave each attempt room for real round trips.
pub fn local_config(database: &TestDatabase) -> VerifierConfig {
    let spec = PollSpec::new(Duration::from_millis(200), Duration::from_secs(20))
        .with_attempt_timeout(Duration::from_secs(10));
    let mut config = config_with(spec);
    config.database.database = database.name.clone();
    config.database.user = database.user.clone();
    config
}

/// Loopback proxy to `target` that hangs up, once, in place of
/// forwarding the `fail_on`-th client message containing `marker`
pub struct CutoffProxy {
    pub addr: SocketAddr,
    forwarded: Arc<AtomicUsize>,
}

impl CutoffProxy {
    pub async fn start(target: SocketAddr, marker: &'static str, fail_on: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let forwarded = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicBool::new(false));

        let counter = forwarded.clone();
        tokio::spawn(async move {
            while let Ok((client, _)) = listener.accept().await {
                let Ok(server) = TcpStream::connect(target).await else {
                    continue;
                };
                tokio::spawn(relay(
                    client,
                    server,
                    marker.as_bytes(),
                    fail_on,
                    counter.clone(),
                    fired.clone(),
                ));
            }
        });

        Self { addr, forwarded }
    }

    /// Messages containing the marker that reached the server
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::SeqCst)
    }
}

async fn relay(
    client: TcpStream,
    server: TcpStream,
    marker: &'static [u8],
    fail_on: usize,
    forwarded: Arc<AtomicUsize>,
    fired: Arc<AtomicBool>,
) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut server_read, mut server_write) = server.into_split();
    let downstream = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut server_read, &mut client_write).await;
    });

    let mut buf = vec![0u8; 8192];
    loop {
        let n = match client_read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = &buf[..n];
        let hits = chunk.windows(marker.len()).filter(|w| *w == marker).count();
        if hits > 0
            && !fired.load(Ordering::SeqCst)
            && forwarded.load(Ordering::SeqCst) + hits >= fail_on
        {
            fired.store(true, Ordering::SeqCst);
            break;
        }
        if server_write.write_all(chunk).await.is_err() {
            break;
        }
        forwarded.fetch_add(hits, Ordering::SeqCst);
    }

    // Dropping both halves of each socket closes the connection
    downstream.abort();
}
