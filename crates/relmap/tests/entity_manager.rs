//! End-to-end tests for the entity manager against a recording executor.

use asupersync::runtime::RuntimeBuilder;
use relmap::prelude::*;
use relmap::{
    ArrayCache, AssociationMetadata, CascadeSet, CountWalker, CyclePolicy, FieldMetadata,
    JoinColumnMetadata, JoinTableMetadata, MappingErrorKind, SqlType, WalkerType,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

fn run<T>(f: impl Future<Output = T>) -> T {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

/// Records every call, hands out sequential ids and replays queued result sets.
#[derive(Default)]
struct RecordingExecutor {
    log: Mutex<Vec<(String, Vec<Value>)>>,
    results: Mutex<VecDeque<Vec<Row>>>,
    next_id: Mutex<i64>,
    fail_prefix: Option<String>,
}

impl RecordingExecutor {
    fn failing_on(prefix: &str) -> Self {
        Self {
            fail_prefix: Some(prefix.to_string()),
            ..Self::default()
        }
    }

    fn returning(self, rows: Vec<Row>) -> Self {
        self.results.lock().unwrap().push_back(rows);
        self
    }

    fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(sql, _)| sql.clone()).collect()
    }

    fn entries(&self) -> Vec<(String, Vec<Value>)> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, sql: &str, params: &[Value]) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        match &self.fail_prefix {
            Some(prefix) if sql.starts_with(prefix.as_str()) => {
                Err(Error::Custom("disk full".to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl DatabaseExecutor for RecordingExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = match self.record(sql, params) {
            Ok(()) => Outcome::Ok(self.results.lock().unwrap().pop_front().unwrap_or_default()),
            Err(e) => Outcome::Err(e),
        };
        async move { outcome }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = match self.record(sql, params) {
            Ok(()) => Outcome::Ok(1),
            Err(e) => Outcome::Err(e),
        };
        async move { outcome }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let outcome = match self.record(sql, params) {
            Ok(()) => {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                Outcome::Ok(*next)
            }
            Err(e) => Outcome::Err(e),
        };
        async move { outcome }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = match self.record("BEGIN", &[]) {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        };
        async move { outcome }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = match self.record("COMMIT", &[]) {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        };
        async move { outcome }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = match self.record("ROLLBACK", &[]) {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        };
        async move { outcome }
    }
}

fn registry() -> Arc<dyn MetadataProvider> {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityMetadata::builder("Customer")
                .table("customers")
                .id(FieldMetadata::new("id", SqlType::BigInt))
                .field(FieldMetadata::new("name", SqlType::Text))
                .association(
                    AssociationMetadata::one_to_many("orders", "Order", "customer")
                        .cascade(CascadeSet::persist().with_remove()),
                )
                .build()
                .unwrap(),
        )
        .entity(
            EntityMetadata::builder("Order")
                .table("orders")
                .id(FieldMetadata::new("id", SqlType::BigInt))
                .field(FieldMetadata::new("name", SqlType::Text))
                .association(
                    AssociationMetadata::many_to_one("customer", "Customer")
                        .join_column(JoinColumnMetadata::new("customer_id", "id").not_null()),
                )
                .association(AssociationMetadata::many_to_many("products", "Product"))
                .build()
                .unwrap(),
        )
        .entity(
            EntityMetadata::builder("Product")
                .table("products")
                .id(FieldMetadata::new("id", SqlType::BigInt))
                .field(FieldMetadata::new("title", SqlType::Text))
                .build()
                .unwrap(),
        )
        .entity(
            EntityMetadata::builder("Node")
                .table("nodes")
                .id(FieldMetadata::new("id", SqlType::BigInt))
                .field(FieldMetadata::new("name", SqlType::Text))
                .association(AssociationMetadata::many_to_one("partner", "Node"))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    Arc::new(registry)
}

fn manager(executor: RecordingExecutor) -> EntityManager<RecordingExecutor> {
    EntityManager::new(Arc::new(executor), registry())
}

fn customer_row(id: i64, name: &str) -> Row {
    Row::new(
        vec!["c0_".to_string(), "c1_".to_string()],
        vec![Value::BigInt(id), Value::Text(name.to_string())],
    )
}

/// A managed entity as if loaded from storage.
fn loaded(em: &mut EntityManager<RecordingExecutor>, entity: &str, id: i64, field: &str, value: &str) -> EntityRef {
    let entity = em.create(entity).unwrap();
    entity.write().set("id", id).unwrap();
    entity.write().set(field, value).unwrap();
    em.unit_of_work_mut().register_managed(&entity).unwrap()
}

#[test]
fn test_flush_inserts_referenced_entity_first() {
    let mut em = manager(RecordingExecutor::default());
    let cx = Cx::for_testing();

    let customer = em.create("Customer").unwrap();
    customer.write().set("name", "Ada").unwrap();
    let order = em.create("Order").unwrap();
    order.write().set("name", "o1").unwrap();
    order
        .write()
        .set_reference("customer", Some(customer.clone()))
        .unwrap();

    em.persist(&order).unwrap();
    em.persist(&customer).unwrap();
    assert_eq!(em.state(&order), EntityState::Managed);

    let report = unwrap_outcome(run(em.flush(&cx)));
    assert_eq!(report.inserted, 2);
    assert_eq!(
        em.executor().entries(),
        vec![
            ("BEGIN".to_string(), vec![]),
            (
                "INSERT INTO \"customers\" (\"name\") VALUES ($1)".to_string(),
                vec![Value::Text("Ada".into())]
            ),
            (
                "INSERT INTO \"orders\" (\"name\", \"customer_id\") VALUES ($1, $2)".to_string(),
                vec![Value::Text("o1".into()), Value::BigInt(1)]
            ),
            ("COMMIT".to_string(), vec![]),
        ]
    );
    assert_eq!(customer.identifier(), Some(Identifier::single(1i64)));
    assert_eq!(order.identifier(), Some(Identifier::single(2i64)));
    assert!(!em.unit_of_work().has_changes());
}

#[test]
fn test_flush_without_changes_skips_transaction() {
    let mut em = manager(RecordingExecutor::default());
    let cx = Cx::for_testing();
    loaded(&mut em, "Customer", 1, "name", "Ada");

    let report = unwrap_outcome(run(em.flush(&cx)));
    assert_eq!(report.total(), 0);
    assert!(em.executor().statements().is_empty());
}

#[test]
fn test_flush_updates_only_changed_fields() {
    let mut em = manager(RecordingExecutor::default());
    let cx = Cx::for_testing();
    let customer = loaded(&mut em, "Customer", 1, "name", "Ada");
    customer.write().set("name", "Grace").unwrap();

    let report = unwrap_outcome(run(em.flush(&cx)));
    assert_eq!(report.updated, 1);
    assert_eq!(
        em.executor().entries()[1],
        (
            "UPDATE \"customers\" SET \"name\" = $1 WHERE \"id\" = $2".to_string(),
            vec![Value::Text("Grace".into()), Value::BigInt(1)]
        )
    );

    // The snapshot moved to the written state
    unwrap_outcome(run(em.flush(&cx)));
    assert_eq!(em.executor().statements().len(), 3);
}

#[test]
fn test_collection_change_writes_join_table() {
    let mut em = manager(RecordingExecutor::default());
    let cx = Cx::for_testing();
    let order = loaded(&mut em, "Order", 3, "name", "o3");
    let product = loaded(&mut em, "Product", 7, "title", "lamp");

    order
        .write()
        .collection_mut("products")
        .unwrap()
        .add(product.clone());
    assert!(em.unit_of_work().has_changes());

    let report = unwrap_outcome(run(em.flush(&cx)));
    assert_eq!(report.collection_updates, 1);
    assert_eq!(
        em.executor().entries()[1],
        (
            "INSERT INTO \"order_product\" (\"order_id\", \"product_id\") VALUES ($1, $2)".to_string(),
            vec![Value::BigInt(3), Value::BigInt(7)]
        )
    );
}

#[test]
fn test_remove_deletes_referrer_before_referenced() {
    let mut em = manager(RecordingExecutor::default());
    let cx = Cx::for_testing();
    let customer = loaded(&mut em, "Customer", 1, "name", "Ada");
    let order = em.create("Order").unwrap();
    order.write().set("id", 2i64).unwrap();
    order
        .write()
        .set_reference("customer", Some(customer.clone()))
        .unwrap();
    let order = em.unit_of_work_mut().register_managed(&order).unwrap();

    em.remove(&customer).unwrap();
    em.remove(&order).unwrap();
    assert_eq!(em.state(&customer), EntityState::Removed);

    let report = unwrap_outcome(run(em.flush(&cx)));
    assert_eq!(report.deleted, 2);
    assert_eq!(
        em.executor().statements(),
        vec![
            "BEGIN",
            "DELETE FROM \"order_product\" WHERE \"order_id\" = $1",
            "DELETE FROM \"orders\" WHERE \"id\" = $1",
            "DELETE FROM \"customers\" WHERE \"id\" = $1",
            "COMMIT",
        ]
    );
    assert_eq!(em.state(&customer), EntityState::Detached);
}

#[test]
fn test_failed_flush_rolls_back() {
    let mut em = manager(RecordingExecutor::failing_on("INSERT INTO \"orders\""));
    let cx = Cx::for_testing();

    let customer = em.create("Customer").unwrap();
    customer.write().set("name", "Ada").unwrap();
    let order = em.create("Order").unwrap();
    order
        .write()
        .set_reference("customer", Some(customer.clone()))
        .unwrap();
    em.persist(&customer).unwrap();
    em.persist(&order).unwrap();

    match expect_err(run(em.flush(&cx))) {
        Error::Persistence(failure) => {
            assert_eq!(failure.operation, "insert");
            assert_eq!(failure.applied, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    let statements = em.executor().statements();
    assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
    assert!(!statements.iter().any(|s| s == "COMMIT"));

    // Generated ids are undone and the work stays scheduled
    assert_eq!(customer.identifier(), None);
    assert!(em.unit_of_work().has_changes());
    assert_eq!(em.state(&order), EntityState::Managed);
}

#[test]
fn test_nullable_cycle_is_broken_with_extra_update() {
    let mut em = manager(RecordingExecutor::default());
    let cx = Cx::for_testing();
    let a = em.create("Node").unwrap();
    a.write().set("name", "a").unwrap();
    let b = em.create("Node").unwrap();
    b.write().set("name", "b").unwrap();
    a.write().set_reference("partner", Some(b.clone())).unwrap();
    b.write().set_reference("partner", Some(a.clone())).unwrap();
    em.persist(&a).unwrap();
    em.persist(&b).unwrap();

    let report = unwrap_outcome(run(em.flush(&cx)));
    assert_eq!(report.inserted, 2);
    assert_eq!(report.extra_updates, 1);

    let entries = em.executor().entries();
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[1].1[1], Value::Null);
    assert!(entries[3].0.starts_with("UPDATE \"nodes\" SET \"partner_id\" = $1"));
    assert_eq!(entries[4].0, "COMMIT");
}

#[test]
fn test_cycle_rejected_by_configuration() {
    let config = Configuration::new().cycle_policy(CyclePolicy::Reject);
    let mut em = EntityManager::with_config(Arc::new(RecordingExecutor::default()), registry(), config);
    let cx = Cx::for_testing();
    let a = em.create("Node").unwrap();
    let b = em.create("Node").unwrap();
    a.write().set_reference("partner", Some(b.clone())).unwrap();
    b.write().set_reference("partner", Some(a.clone())).unwrap();
    em.persist(&a).unwrap();
    em.persist(&b).unwrap();

    assert!(matches!(
        expect_err(run(em.flush(&cx))),
        Error::CommitOrdering(_)
    ));
    assert_eq!(em.executor().statements(), vec!["BEGIN", "ROLLBACK"]);
}

#[test]
fn test_find_prefers_identity_map() {
    let mut em = manager(RecordingExecutor::default());
    let cx = Cx::for_testing();
    let customer = loaded(&mut em, "Customer", 1, "name", "Ada");

    let found = unwrap_outcome(run(em.find(&cx, "Customer", Identifier::single(1i64))));
    assert!(found.unwrap().ptr_eq(&customer));
    assert!(em.executor().statements().is_empty());
}

#[test]
fn test_find_loads_and_registers() {
    let mut em = manager(RecordingExecutor::default().returning(vec![customer_row(5, "Ada")]));
    let cx = Cx::for_testing();

    let found = unwrap_outcome(run(em.find(&cx, "Customer", Identifier::single(5i64))))
        .expect("customer 5");
    assert_eq!(found.read().get("name"), Some(&Value::Text("Ada".into())));
    assert_eq!(em.state(&found), EntityState::Managed);
    assert_eq!(
        em.executor().entries(),
        vec![(
            "SELECT t0_.\"id\" AS c0_, t0_.\"name\" AS c1_ FROM \"customers\" t0_ WHERE t0_.\"id\" = $1"
                .to_string(),
            vec![Value::BigInt(5)]
        )]
    );

    // Second lookup is served from the identity map
    let again = unwrap_outcome(run(em.find(&cx, "Customer", Identifier::single(5i64))));
    assert!(again.unwrap().ptr_eq(&found));
    assert_eq!(em.executor().statements().len(), 1);
}

#[test]
fn test_find_missing_and_wrong_arity() {
    let mut em = manager(RecordingExecutor::default());
    let cx = Cx::for_testing();
    let found = unwrap_outcome(run(em.find(&cx, "Customer", Identifier::single(9i64))));
    assert!(found.is_none());

    let wrong = Identifier::new(vec![Value::BigInt(1), Value::BigInt(2)]);
    assert!(matches!(
        expect_err(run(em.find(&cx, "Customer", wrong))),
        Error::Custom(_)
    ));
}

#[test]
fn test_get_result_keeps_managed_instances() {
    let mut em = manager(RecordingExecutor::default().returning(vec![
        customer_row(1, "Ada"),
        customer_row(2, "Bob"),
        customer_row(1, "Ada"),
    ]));
    let cx = Cx::for_testing();
    let bob = loaded(&mut em, "Customer", 2, "name", "Bob");
    bob.write().set("name", "Robert").unwrap();

    let mut query = em.create_query("SELECT c FROM Customer c WHERE c.name LIKE :pattern ORDER BY c.id");
    query.set_parameter("pattern", "%");
    let customers = unwrap_outcome(run(em.get_result(&cx, &mut query)));

    assert_eq!(customers.len(), 2);
    assert!(customers[1].ptr_eq(&bob));
    // Local modifications are not overwritten by the loaded row
    assert_eq!(bob.read().get("name"), Some(&Value::Text("Robert".into())));
    assert_eq!(em.unit_of_work().size(), 2);
    assert_eq!(
        em.executor().entries()[0].0,
        "SELECT t0_.\"id\" AS c0_, t0_.\"name\" AS c1_ FROM \"customers\" t0_ \
         WHERE t0_.\"name\" LIKE $1 ORDER BY t0_.\"id\" ASC"
    );
}

#[test]
fn test_named_parameters_bound_by_position() {
    let mut em = manager(RecordingExecutor::default());
    let cx = Cx::for_testing();
    let mut query = em.create_query(
        "SELECT o FROM Order o JOIN o.customer c WHERE c.name = :name AND o.id > :min",
    );
    query.set_parameter("min", 10i64).set_parameter("name", "Ada");
    let orders = unwrap_outcome(run(em.get_result(&cx, &mut query)));
    assert!(orders.is_empty());

    assert_eq!(
        em.executor().entries(),
        vec![(
            "SELECT t0_.\"id\" AS c0_, t0_.\"name\" AS c1_ FROM \"orders\" t0_ \
             INNER JOIN \"customers\" t1_ ON t0_.\"customer_id\" = t1_.\"id\" \
             WHERE t1_.\"name\" = $1 AND t0_.\"id\" > $2"
                .to_string(),
            vec![Value::Text("Ada".into()), Value::BigInt(10)]
        )]
    );
}

#[test]
fn test_query_errors_surface() {
    let mut em = manager(RecordingExecutor::default());
    let cx = Cx::for_testing();

    let mut broken = em.create_query("SELECT c FROM Customer");
    assert!(matches!(
        expect_err(run(em.get_result(&cx, &mut broken))),
        Error::QuerySyntax(_)
    ));

    let mut unbound = em.create_query("SELECT c FROM Customer c WHERE c.name = :name");
    assert!(matches!(
        expect_err(run(em.get_result(&cx, &mut unbound))),
        Error::Query(_)
    ));
    assert!(em.executor().statements().is_empty());
}

#[test]
fn test_default_tree_walker_counts() {
    let config = Configuration::new().default_tree_walker(WalkerType::of::<CountWalker>());
    let em = EntityManager::with_config(Arc::new(RecordingExecutor::default()), registry(), config);

    let mut query = em.create_query("SELECT c FROM Customer c WHERE c.name = 'Ada' ORDER BY c.name");
    assert_eq!(
        query.sql().unwrap(),
        "SELECT COUNT(DISTINCT t0_.\"id\") AS c0_ FROM \"customers\" t0_ WHERE t0_.\"name\" = $1"
    );
}

#[test]
fn test_query_cache_shared_across_queries() {
    let cache = Arc::new(ArrayCache::new(32));
    let config = Configuration::new().query_cache(cache.clone());
    let em = EntityManager::with_config(Arc::new(RecordingExecutor::default()), registry(), config);

    let first = em.create_query("SELECT c FROM Customer c").sql().unwrap();
    let second = em.create_query("SELECT c FROM Customer c").sql().unwrap();
    assert_eq!(first, second);
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
}

#[test]
fn test_metadata_cache_shared_between_managers() {
    let cache = Arc::new(ArrayCache::new(32));
    let config = Configuration::new().metadata_cache(cache.clone());

    let first = EntityManager::with_config(Arc::new(RecordingExecutor::default()), registry(), config.clone());
    let a = first.metadata_for("Customer").unwrap();
    let b = first.metadata_for("Customer").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.stats().entries, 1);

    let second = EntityManager::with_config(Arc::new(RecordingExecutor::default()), registry(), config);
    let c = second.metadata_for("Customer").unwrap();
    assert_eq!(c.table_name(), "customers");
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn test_join_table_must_cover_owner_identifier() {
    let result = EntityMetadata::builder("Membership")
        .id(FieldMetadata::new("userId", SqlType::BigInt))
        .id(FieldMetadata::new("groupId", SqlType::BigInt))
        .association(
            AssociationMetadata::many_to_many("tags", "Tag").join_table(
                JoinTableMetadata::new("membership_tag")
                    .join_column(JoinColumnMetadata::new("membership_user_id", "userId")),
            ),
        )
        .build();
    match result {
        Err(Error::Mapping(e)) => assert_eq!(e.kind, MappingErrorKind::JoinColumnMismatch),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_lifecycle_passthroughs() {
    let mut em = manager(RecordingExecutor::default());
    let customer = loaded(&mut em, "Customer", 1, "name", "Ada");
    assert!(em.contains(&customer));

    em.detach(&customer);
    assert_eq!(em.state(&customer), EntityState::Detached);
    assert!(matches!(em.remove(&customer), Err(Error::InvalidEntityState(_))));

    let other = loaded(&mut em, "Customer", 2, "name", "Bob");
    em.clear();
    assert!(!em.contains(&other));
    assert!(matches!(em.create("Nobody"), Err(Error::Mapping(_))));
}
