use casetable_core::{
    ActionError, ActionObserver, AttributeSnapshot, CaseInsertion, DataSet, DataSetAction,
    DataSetOptions, DerivationSpec, MemoryRemoteStore, NamedCase, RemoteError, RemoteStore,
    RemoteSync, RemoteSyncOptions, Scheduler, SequentialIdGenerator, Value, WeakDataSet,
};
use serde_json::json;
use std::cell::Cell;
use std::rc::Rc;

const ROOT: &str = "datasets/shared";

struct Fixture {
    scheduler: Scheduler,
    store: Rc<MemoryRemoteStore>,
}

impl Fixture {
    fn new() -> Self {
        let scheduler = Scheduler::new();
        let store = Rc::new(MemoryRemoteStore::new(scheduler.clone()));
        Self { scheduler, store }
    }

    fn client(&self, prefix: &str) -> DataSet {
        DataSet::new(
            DataSetOptions::default()
                .with_name(format!("client-{prefix}"))
                .with_id_generator(Rc::new(SequentialIdGenerator::new(prefix)))
                .with_scheduler(self.scheduler.clone()),
        )
    }

    fn attach(&self, data_set: &DataSet) -> RemoteSync {
        RemoteSync::attach(
            data_set,
            self.store.clone(),
            RemoteSyncOptions::default().with_root(ROOT),
        )
        .unwrap()
    }

    fn settle(&self) {
        self.scheduler.run_until_idle();
    }
}

fn populate(data_set: &DataSet) {
    data_set
        .add_attribute_with_id(AttributeSnapshot::named("name").with_id("name"), None)
        .unwrap();
    data_set
        .add_attribute_with_id(AttributeSnapshot::named("num").with_id("num"), None)
        .unwrap();
    data_set
        .add_cases_with_ids(
            &[
                NamedCase::with_id("c1").set("name", "Ada").set("num", 36.0),
                NamedCase::with_id("c2").set("name", "Bo").set("num", 7.0),
            ],
            CaseInsertion::Append,
        )
        .unwrap();
}

fn assert_same_content(left: &DataSet, right: &DataSet) {
    let left = left.snapshot();
    let right = right.snapshot();
    assert_eq!(left.attributes, right.attributes);
    assert_eq!(left.cases, right.cases);
}

#[test]
fn each_local_edit_costs_one_write_and_its_echo_none() {
    let fixture = Fixture::new();
    let data_set = fixture.client("a");
    let sync = fixture.attach(&data_set);
    // Empty root: only the id and name properties are written.
    assert_eq!(fixture.store.write_count(), 2);

    data_set
        .add_attribute_with_id(AttributeSnapshot::named("num").with_id("num"), None)
        .unwrap();
    assert_eq!(fixture.store.write_count(), 3);
    assert!(data_set.attr_from_id("num").is_none());
    assert_eq!(sync.pending_echoes(), 1);

    fixture.settle();
    assert_eq!(fixture.store.write_count(), 3);
    assert_eq!(sync.pending_echoes(), 0);
    assert_eq!(data_set.attr_from_id("num").unwrap().name, "num");

    data_set
        .add_cases_with_ids(&[NamedCase::with_id("c1").set("num", 1.0)], CaseInsertion::Append)
        .unwrap();
    assert_eq!(data_set.case_count(), 0);
    fixture.settle();
    assert_eq!(fixture.store.write_count(), 4);
    assert_eq!(data_set.case_ids(), ["c1"]);

    data_set
        .set_case_values(vec![NamedCase::with_id("c1").set("num", 2.0)])
        .unwrap();
    assert_eq!(data_set.get_value("c1", "num"), Some(Value::from(1.0)));
    fixture.settle();
    assert_eq!(fixture.store.write_count(), 5);
    assert_eq!(data_set.get_value("c1", "num"), Some(Value::from(2.0)));
    assert!(!sync.is_applying_remote());
}

#[test]
fn pending_echoes_track_unacknowledged_writes() {
    let fixture = Fixture::new();
    let data_set = fixture.client("a");
    let sync = fixture.attach(&data_set);

    data_set
        .add_attribute_with_id(AttributeSnapshot::named("x").with_id("x"), None)
        .unwrap();
    data_set
        .add_cases_with_ids(
            &[NamedCase::with_id("c1"), NamedCase::with_id("c2")],
            CaseInsertion::Append,
        )
        .unwrap();
    assert_eq!(sync.pending_echoes(), 3);

    fixture.settle();
    assert_eq!(sync.pending_echoes(), 0);
    assert_eq!(data_set.case_ids(), ["c1", "c2"]);
}

#[test]
fn rewriting_unchanged_values_leaves_no_echo_behind() {
    let fixture = Fixture::new();
    let data_set = fixture.client("a");
    let sync = fixture.attach(&data_set);
    data_set
        .add_attribute_with_id(AttributeSnapshot::named("num").with_id("num"), None)
        .unwrap();
    data_set
        .add_cases_with_ids(&[NamedCase::with_id("c1").set("num", 1.0)], CaseInsertion::Append)
        .unwrap();
    fixture.settle();
    let writes = fixture.store.write_count();

    for _ in 0..50 {
        data_set
            .set_case_values(vec![NamedCase::with_id("c1").set("num", 1.0)])
            .unwrap();
        fixture.settle();
    }
    assert_eq!(fixture.store.write_count(), writes);
    assert_eq!(sync.pending_echoes(), 0);

    // While an echo is outstanding the local value is stale, so the write
    // still goes out. A rewrite the remote already holds expects no echo.
    data_set
        .set_case_values(vec![NamedCase::with_id("c1").set("num", 2.0)])
        .unwrap();
    data_set
        .set_case_values(vec![NamedCase::with_id("c1").set("num", 2.0)])
        .unwrap();
    assert_eq!(fixture.store.write_count(), writes + 2);
    assert_eq!(sync.pending_echoes(), 1);
    fixture.settle();
    assert_eq!(sync.pending_echoes(), 0);

    data_set
        .set_case_values(vec![NamedCase::with_id("c1").set("num", 3.0)])
        .unwrap();
    data_set
        .set_case_values(vec![NamedCase::with_id("c1").set("num", 2.0)])
        .unwrap();
    assert_eq!(sync.pending_echoes(), 2);
    fixture.settle();
    assert_eq!(sync.pending_echoes(), 0);
    assert_eq!(data_set.get_value("c1", "num"), Some(Value::from(2.0)));

    data_set.set_attribute_name("num", "num").unwrap();
    assert_eq!(sync.pending_echoes(), 0);
    assert_eq!(fixture.store.write_count(), writes + 4);
}

struct EditOnFirstAdd {
    data_set: WeakDataSet,
    fired: Cell<bool>,
}

impl ActionObserver for EditOnFirstAdd {
    fn on_action(&self, _data_set: &DataSet, action: &DataSetAction) {
        if !matches!(action, DataSetAction::AddCases { .. }) || self.fired.replace(true) {
            return;
        }
        if let Some(data_set) = self.data_set.upgrade() {
            data_set
                .set_case_values(vec![NamedCase::with_id("c1").set("num", 99.0)])
                .unwrap();
        }
    }
}

#[test]
fn edits_made_while_replaying_an_echo_are_not_forwarded() {
    let fixture = Fixture::new();
    let data_set = fixture.client("a");
    let sync = fixture.attach(&data_set);
    data_set
        .add_attribute_with_id(AttributeSnapshot::named("num").with_id("num"), None)
        .unwrap();
    fixture.settle();
    let writes = fixture.store.write_count();

    let observer = Rc::new(EditOnFirstAdd {
        data_set: data_set.downgrade(),
        fired: Cell::new(false),
    });
    data_set.add_observer(observer.clone());

    data_set
        .add_cases_with_ids(&[NamedCase::with_id("c1").set("num", 1.0)], CaseInsertion::Append)
        .unwrap();
    assert!(!observer.fired.get());
    assert_eq!(fixture.store.write_count(), writes + 1);

    fixture.settle();
    assert!(observer.fired.get());
    assert_eq!(fixture.store.write_count(), writes + 1);
    assert_eq!(data_set.get_value("c1", "num"), Some(Value::from(99.0)));
    assert!(!sync.is_applying_remote());
    assert_eq!(sync.pending_echoes(), 0);

    // Back in the idle phase, edits are forwarded again.
    data_set
        .set_case_values(vec![NamedCase::with_id("c1").set("num", 5.0)])
        .unwrap();
    assert_eq!(fixture.store.write_count(), writes + 2);
    assert_eq!(sync.pending_echoes(), 1);
    fixture.settle();
    assert_eq!(data_set.get_value("c1", "num"), Some(Value::from(5.0)));
    assert_eq!(sync.pending_echoes(), 0);
}

#[test]
fn read_only_store_drops_local_edits_but_follows_remote() {
    let fixture = Fixture::new();
    let writer = fixture.client("w");
    let reader = DataSet::new(
        DataSetOptions::default()
            .read_only(true)
            .with_scheduler(fixture.scheduler.clone()),
    );
    let _writer_sync = fixture.attach(&writer);
    let _reader_sync = fixture.attach(&reader);
    let writes = fixture.store.write_count();

    reader
        .add_attribute_with_id(AttributeSnapshot::named("x").with_id("x"), None)
        .unwrap();
    fixture.settle();
    assert_eq!(fixture.store.write_count(), writes);
    assert!(reader.attr_from_id("x").is_none());

    writer
        .add_attribute_with_id(AttributeSnapshot::named("y").with_id("y"), None)
        .unwrap();
    fixture.settle();
    assert!(reader.attr_from_id("y").is_some());
    assert!(writer.attr_from_id("y").is_some());
}

#[test]
fn failed_remote_write_is_returned_and_leaves_state_untouched() {
    let fixture = Fixture::new();
    let data_set = fixture.client("a");
    let sync = fixture.attach(&data_set);
    data_set
        .add_attribute_with_id(AttributeSnapshot::named("num").with_id("num"), None)
        .unwrap();
    fixture.settle();
    let before = data_set.snapshot();
    let writes = fixture.store.write_count();

    fixture.store.set_offline(true);
    let err = data_set
        .add_cases_with_ids(&[NamedCase::with_id("c1").set("num", 1.0)], CaseInsertion::Append)
        .unwrap_err();
    assert!(matches!(
        err,
        ActionError::Remote(RemoteError::Unavailable(_))
    ));

    fixture.settle();
    assert_eq!(data_set.snapshot(), before);
    assert_eq!(fixture.store.write_count(), writes);
    assert_eq!(sync.pending_echoes(), 0);

    fixture.store.set_offline(false);
    data_set
        .add_cases_with_ids(&[NamedCase::with_id("c1").set("num", 1.0)], CaseInsertion::Append)
        .unwrap();
    fixture.settle();
    assert_eq!(data_set.case_ids(), ["c1"]);
}

#[test]
fn attach_seeds_an_empty_root_from_local_content() {
    let fixture = Fixture::new();
    let data_set = fixture.client("a");
    populate(&data_set);
    let _sync = fixture.attach(&data_set);

    let cases = format!("{ROOT}/cases");
    let attributes = format!("{ROOT}/attributes");
    let properties = format!("{ROOT}/properties");
    assert_eq!(
        fixture.store.record(&cases, "c1"),
        Some(json!({"name": "Ada", "num": 36.0}))
    );
    let attribute_ids: Vec<String> = fixture
        .store
        .get(&attributes)
        .unwrap()
        .into_iter()
        .filter_map(|record| record.value["id"].as_str().map(str::to_string))
        .collect();
    assert_eq!(attribute_ids, ["name", "num"]);
    assert_eq!(
        fixture.store.record(&properties, "name"),
        Some(json!("client-a"))
    );

    // Seeding happens before listening: no echoes to replay.
    fixture.settle();
    assert_eq!(data_set.case_ids(), ["c1", "c2"]);
    assert_eq!(data_set.attributes().len(), 2);
}

#[test]
fn attach_without_seeding_leaves_local_content_unpublished() {
    let fixture = Fixture::new();
    let data_set = fixture.client("a");
    populate(&data_set);
    let _sync = RemoteSync::attach(
        &data_set,
        fixture.store.clone(),
        RemoteSyncOptions::default()
            .with_root(ROOT)
            .seed_from_local(false),
    )
    .unwrap();

    assert!(fixture.store.get(&format!("{ROOT}/cases")).unwrap().is_empty());
    assert_eq!(fixture.store.write_count(), 2);
    assert_eq!(data_set.case_count(), 2);
}

#[test]
fn attach_replays_existing_remote_content() {
    let fixture = Fixture::new();
    let store = &fixture.store;
    store
        .set(&format!("{ROOT}/properties"), "name", json!("remote name"))
        .unwrap();
    store
        .push(
            &format!("{ROOT}/attributes"),
            json!({"id": "a1", "name": "score", "units": "pts"}),
        )
        .unwrap();
    store
        .set(&format!("{ROOT}/cases"), "c1", json!({"a1": 5, "flag": true}))
        .unwrap();
    store
        .set(&format!("{ROOT}/cases"), "bad", json!("not an object"))
        .unwrap();
    let writes = store.write_count();

    let data_set = fixture.client("a");
    let sync = fixture.attach(&data_set);
    assert_eq!(store.write_count(), writes);
    assert_eq!(sync.root(), ROOT);

    assert_eq!(data_set.name(), "remote name");
    let score = data_set.attr_from_id("a1").unwrap();
    assert_eq!(score.name, "score");
    assert_eq!(score.units, "pts");
    assert_eq!(data_set.case_ids(), ["c1"]);
    assert_eq!(data_set.get_value("c1", "a1"), Some(Value::from(5.0)));
}

#[test]
fn two_clients_on_one_store_converge() {
    let fixture = Fixture::new();
    let a = fixture.client("a");
    let b = fixture.client("b");
    populate(&a);
    let _sync_a = fixture.attach(&a);
    let _sync_b = fixture.attach(&b);
    assert_same_content(&a, &b);
    assert_eq!(b.name(), "client-a");

    a.set_case_values(vec![NamedCase::with_id("c1").set("num", 10.0)])
        .unwrap();
    b.remove_cases(&["c2"]).unwrap();
    b.add_attribute_with_id(AttributeSnapshot::named("extra").with_id("extra"), None)
        .unwrap();
    a.add_cases_with_ids(
        &[NamedCase::with_id("c3").set("name", "Cy")],
        CaseInsertion::Append,
    )
    .unwrap();
    fixture.settle();

    assert_eq!(a.case_ids(), ["c1", "c3"]);
    assert_eq!(a.get_value("c1", "num"), Some(Value::from(10.0)));
    assert!(a.attr_from_id("extra").is_some());
    assert_same_content(&a, &b);

    a.remove_attribute("num").unwrap();
    b.set_case_values(vec![NamedCase::with_id("c3").set("extra", "x")])
        .unwrap();
    fixture.settle();
    assert!(b.attr_from_id("num").is_none());
    assert_eq!(a.get_value("c3", "extra"), Some(Value::text("x")));
    assert_same_content(&a, &b);
}

#[test]
fn renames_reach_every_client_and_taken_names_are_not_written() {
    let fixture = Fixture::new();
    let a = fixture.client("a");
    let b = fixture.client("b");
    populate(&a);
    let _sync_a = fixture.attach(&a);
    let _sync_b = fixture.attach(&b);

    a.set_attribute_name("num", "age").unwrap();
    assert!(a.attr_from_name("age").is_none());
    fixture.settle();
    assert_eq!(a.attr_from_id("num").unwrap().name, "age");
    assert_eq!(b.attr_from_id("num").unwrap().name, "age");

    let writes = fixture.store.write_count();
    b.set_attribute_name("num", "name").unwrap();
    fixture.settle();
    assert_eq!(fixture.store.write_count(), writes);
    assert_eq!(a.attr_from_id("num").unwrap().name, "age");
}

#[test]
fn moves_stay_local() {
    let fixture = Fixture::new();
    let a = fixture.client("a");
    let b = fixture.client("b");
    populate(&a);
    let _sync_a = fixture.attach(&a);
    let _sync_b = fixture.attach(&b);
    let writes = fixture.store.write_count();

    a.move_attribute("num", Some("name")).unwrap();
    fixture.settle();
    assert_eq!(fixture.store.write_count(), writes);
    let order = |data_set: &DataSet| -> Vec<String> {
        data_set.attributes().into_iter().map(|attribute| attribute.id).collect()
    };
    assert_eq!(order(&a), ["num", "name"]);
    assert_eq!(order(&b), ["name", "num"]);
}

#[test]
fn detach_stops_forwarding_and_listening() {
    let fixture = Fixture::new();
    let a = fixture.client("a");
    let b = fixture.client("b");
    populate(&a);
    let sync_a = fixture.attach(&a);
    let _sync_b = fixture.attach(&b);
    assert_eq!(fixture.store.listener_count(), 6);
    assert_eq!(a.interceptor_count(), 1);

    sync_a.detach();
    sync_a.detach();
    assert!(!sync_a.is_attached());
    assert_eq!(fixture.store.listener_count(), 3);
    assert_eq!(a.interceptor_count(), 0);

    let writes = fixture.store.write_count();
    a.remove_cases(&["c1"]).unwrap();
    assert_eq!(a.case_ids(), ["c2"]);
    assert_eq!(fixture.store.write_count(), writes);

    b.remove_cases(&["c2"]).unwrap();
    fixture.settle();
    assert_eq!(b.case_ids(), ["c1"]);
    assert_eq!(a.case_ids(), ["c2"]);
}

#[test]
fn destroyed_store_detaches_on_the_next_event() {
    let fixture = Fixture::new();
    let a = fixture.client("a");
    let b = fixture.client("b");
    let sync_a = fixture.attach(&a);
    let _sync_b = fixture.attach(&b);

    a.destroy();
    b.add_attribute_with_id(AttributeSnapshot::named("x").with_id("x"), None)
        .unwrap();
    fixture.settle();
    assert!(!sync_a.is_attached());
    assert!(b.attr_from_id("x").is_some());
}

#[test]
fn derived_view_of_a_synced_store_updates_after_the_echo() {
    let fixture = Fixture::new();
    let source = fixture.client("s");
    populate(&source);
    let odds = source
        .derive(
            Some("odds"),
            DerivationSpec::new()
                .attributes(["num"])
                .filter(|case| {
                    case.value("num")
                        .as_number()
                        .is_some_and(|number| number.rem_euclid(2.0) == 1.0)
                })
                .synchronized(),
        )
        .unwrap();
    assert_eq!(odds.case_ids(), ["c2"]);
    let _sync = fixture.attach(&source);

    source
        .add_cases_with_ids(&[NamedCase::with_id("c3").set("num", 3.0)], CaseInsertion::Append)
        .unwrap();
    assert!(!odds.is_synchronizing());
    assert_eq!(source.case_ids(), ["c1", "c2"]);

    fixture.settle();
    assert_eq!(source.case_ids(), ["c1", "c2", "c3"]);
    assert_eq!(odds.case_ids(), ["c2", "c3"]);
}
