//! The database executor capability.
//!
//! [`DatabaseExecutor`] is the seam between relmap and a concrete SQL driver.
//! The unit of work never talks to it directly; the SQL entity persister and
//! query execution do. All operations integrate with asupersync's structured
//! concurrency via the `Cx` context for cancellation.

use crate::dialect::Dialect;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// Executes SQL with positionally bound parameters.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
/// Parameters are always passed separately from the SQL text.
///
/// # Example
///
/// ```rust,ignore
/// let rows = executor.query(&cx, "SELECT t0_.\"id\" AS c0_ FROM \"users\" t0_ WHERE t0_.\"age\" > $1", &[Value::BigInt(18)]).await;
/// ```
pub trait DatabaseExecutor: Send + Sync {
    /// The SQL dialect this executor speaks.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute an INSERT and return the generated identifier.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Commit the current transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Roll back the current transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Execute a query and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, crate::Error>> + Send {
        async move {
            match self.query(cx, sql, params).await {
                Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use std::sync::{Arc, Mutex};

    fn unwrap_outcome<T>(outcome: Outcome<T, crate::Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    #[derive(Default)]
    struct RecordingExecutor {
        statements: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    }

    impl DatabaseExecutor for RecordingExecutor {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn query(
            &self,
            _cx: &Cx,
            sql: &str,
            params: &[Value],
        ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send {
            self.statements
                .lock()
                .unwrap()
                .push((sql.to_string(), params.to_vec()));
            let rows = vec![
                Row::new(vec!["c0_".into()], vec![Value::BigInt(1)]),
                Row::new(vec!["c0_".into()], vec![Value::BigInt(2)]),
            ];
            async move { Outcome::Ok(rows) }
        }

        fn execute(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send {
            async { Outcome::Ok(0) }
        }

        fn insert(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send {
            async { Outcome::Ok(0) }
        }

        fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send {
            async { Outcome::Ok(()) }
        }

        fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send {
            async { Outcome::Ok(()) }
        }

        fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send {
            async { Outcome::Ok(()) }
        }
    }

    #[test]
    fn test_query_one_returns_first_row() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let executor = RecordingExecutor::default();

        rt.block_on(async {
            let row = unwrap_outcome(
                executor
                    .query_one(&cx, "SELECT 1", &[Value::BigInt(7)])
                    .await,
            );
            assert_eq!(row.unwrap().get(0), Some(&Value::BigInt(1)));
        });

        let statements = executor.statements.lock().unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].1, vec![Value::BigInt(7)]);
    }
}
