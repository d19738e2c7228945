use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

pub type DbPool = Pool<AsyncPgConnection>;

/// Connections are only checked out for single membership / persistence
/// queries, never across websocket I/O.
const MAX_CONNECTIONS: usize = 16;

/// Create a Diesel async connection pool.
///
/// Building the pool does not open a connection, so an unreachable database
/// surfaces later as soft membership failures rather than a start-up crash.
pub fn connect(database_url: &str) -> DbPool {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager)
        .max_size(MAX_CONNECTIONS)
        .build()
        .expect("failed to build connection pool");

    tracing::info!(max_connections = MAX_CONNECTIONS, "database pool created");

    pool
}
