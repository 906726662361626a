//! Relational persistence sink.
//!
//! Every worker owns one synchronous connection; handles are never shared
//! across threads. The uniqueness constraint on `submitted_flags` is the
//! source of truth for duplicates - the resubmit cache only reduces how often
//! we get here.

use std::sync::Arc;

use anyhow::{Context, Result};
use postgres::types::Type;
use postgres::{Client, NoTls, Statement};
use tracing::{info, warn};

use flagsrv_proto::flag::Flag;

/// Contract towards the relational store.
pub trait FlagSink {
    /// Insert one accepted flag. Returns `1` when inserted, `0` when the
    /// uniqueness constraint reported a duplicate, negative on error.
    fn insert_flag(&mut self, submitter: u16, flag: &Flag, current_round: i32) -> i32;

    /// Highest team id currently registered.
    fn max_team_id(&mut self) -> Result<i32>;

    /// Highest service id currently registered.
    fn max_service_id(&mut self) -> Result<i32>;
}

/// Builds one sink per worker thread.
pub type SinkFactory = Arc<dyn Fn() -> Box<dyn FlagSink> + Send + Sync>;

const INSERT_FLAG_SQL: &str = "INSERT INTO submitted_flags \
    (submitted_by, team_id, service_id, tick_issued, payload, tick_submitted) \
    VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING";

/// Postgres-backed sink. Connects lazily and reconnects on the next call
/// after a failure; inserts themselves are never retried.
pub struct PgFlagStore {
    url: String,
    conn: Option<Prepared>,
}

struct Prepared {
    client: Client,
    insert: Statement,
}

impl PgFlagStore {
    pub fn new(url: String) -> Self {
        Self { url, conn: None }
    }

    fn ensure_connected(&mut self) -> Result<&mut Prepared> {
        if self.conn.is_none() {
            let mut client =
                Client::connect(&self.url, NoTls).context("connecting to postgres")?;
            // asynchronous commits make the insert path much faster
            if let Err(e) = client.batch_execute("SET SESSION synchronous_commit TO OFF") {
                warn!(error = %e, "could not enable asynchronous commits");
            }
            let insert = client
                .prepare_typed(
                    INSERT_FLAG_SQL,
                    &[
                        Type::INT4,
                        Type::INT4,
                        Type::INT4,
                        Type::INT4,
                        Type::INT4,
                        Type::INT4,
                    ],
                )
                .context("preparing insert statement")?;
            info!("Postgres connection established");
            self.conn = Some(Prepared { client, insert });
        }
        self.conn.as_mut().context("postgres connection missing")
    }
}

impl FlagSink for PgFlagStore {
    fn insert_flag(&mut self, submitter: u16, flag: &Flag, current_round: i32) -> i32 {
        let prepared = match self.ensure_connected() {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "Postgres connection failed");
                return -1;
            }
        };

        let submitted_by = submitter as i32;
        let team_id = flag.team_id as i32;
        let service_id = flag.service_id as i32;
        let tick_issued = flag.round as i32;
        let payload = flag.payload as i32;

        match prepared.client.execute(
            &prepared.insert,
            &[
                &submitted_by,
                &team_id,
                &service_id,
                &tick_issued,
                &payload,
                &current_round,
            ],
        ) {
            Ok(rows) => {
                if rows == 1 {
                    1
                } else {
                    0
                }
            }
            Err(e) => {
                warn!(error = %e, "Postgres INSERT failed");
                // drop the connection; the next call reconnects
                self.conn = None;
                -1
            }
        }
    }

    fn max_team_id(&mut self) -> Result<i32> {
        let result = self
            .ensure_connected()?
            .client
            .query_one("SELECT max(id) FROM teams", &[]);
        match result {
            Ok(row) => Ok(row.get::<_, Option<i32>>(0).unwrap_or(0)),
            Err(e) => {
                self.conn = None;
                Err(e).context("reading max team id")
            }
        }
    }

    fn max_service_id(&mut self) -> Result<i32> {
        let result = self
            .ensure_connected()?
            .client
            .query_one("SELECT max(id) FROM services", &[]);
        match result {
            Ok(row) => Ok(row.get::<_, Option<i32>>(0).unwrap_or(0)),
            Err(e) => {
                self.conn = None;
                Err(e).context("reading max service id")
            }
        }
    }
}
