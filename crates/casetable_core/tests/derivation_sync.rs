use casetable_core::{
    ActionInterceptor, ActionResult, AttributeSnapshot, CaseInsertion, DataSet, DataSetAction,
    DataSetOptions, DerivationSpec, Interception, NamedCase, SequentialIdGenerator, Value,
};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

fn numbers(rows: &[(&str, &str, f64)]) -> DataSet {
    let source = DataSet::new(
        DataSetOptions::default()
            .with_name("numbers")
            .with_id_generator(Rc::new(SequentialIdGenerator::new("s"))),
    );
    source
        .add_attribute_with_id(AttributeSnapshot::named("str").with_id("str"), None)
        .unwrap();
    source
        .add_attribute_with_id(AttributeSnapshot::named("num").with_id("num"), None)
        .unwrap();
    let cases: Vec<NamedCase> = rows
        .iter()
        .map(|(id, text, number)| NamedCase::with_id(*id).set("str", *text).set("num", *number))
        .collect();
    source.add_cases_with_ids(&cases, CaseInsertion::Append).unwrap();
    source
}

fn is_odd(case: &NamedCase) -> bool {
    case.value("num")
        .as_number()
        .is_some_and(|number| number.rem_euclid(2.0) == 1.0)
}

fn odds(source: &DataSet, synchronized: bool) -> DataSet {
    let mut spec = DerivationSpec::new().attributes(["num"]).filter(is_odd);
    if synchronized {
        spec = spec.synchronized();
    }
    source.derive(Some("odds"), spec).unwrap()
}

fn numbers_of(data_set: &DataSet) -> Vec<f64> {
    data_set
        .case_ids()
        .iter()
        .filter_map(|case_id| data_set.get_value(case_id, "num"))
        .filter_map(|value| value.as_number())
        .collect()
}

fn filtered_count(source: &DataSet) -> usize {
    source
        .case_ids()
        .iter()
        .filter_map(|case_id| source.get_case(case_id))
        .filter(is_odd)
        .count()
}

#[test]
fn odds_projection_keeps_matching_cases_and_only_num() {
    let source = numbers(&[("c1", "a", 1.0), ("c2", "b", 2.0), ("c3", "c", 3.0)]);
    let derived = odds(&source, false);

    assert_eq!(derived.name(), "odds");
    assert_eq!(derived.source_id(), Some(source.id()));
    assert_eq!(derived.case_ids(), ["c1", "c3"]);
    assert_eq!(numbers_of(&derived), [1.0, 3.0]);

    let attributes = derived.attributes();
    assert_eq!(attributes.len(), 1);
    assert_eq!(attributes[0].name, "num");
    assert_eq!(attributes[0].source_id.as_deref(), Some("num"));
    assert!(derived.attr_from_name("str").is_none());
    derived
        .with_table(|table| table.check_invariants())
        .unwrap();
}

#[test]
fn derived_store_follows_source_only_after_the_flush() {
    let source = numbers(&[("c1", "a", 1.0), ("c2", "b", 2.0)]);
    let derived = odds(&source, true);

    source
        .add_cases_with_ids(
            &[NamedCase::with_id("c0").set("num", 7.0)],
            CaseInsertion::Before("c1".to_string()),
        )
        .unwrap();
    assert_eq!(derived.case_ids(), ["c1"]);
    assert!(derived.is_synchronizing());

    source.scheduler().run_until_idle();
    assert_eq!(derived.case_ids(), ["c0", "c1"]);
    assert!(!derived.is_synchronizing());
}

#[test]
fn value_changes_move_cases_in_and_out_of_the_filter() {
    let source = numbers(&[
        ("c1", "a", 1.0),
        ("c2", "b", 2.0),
        ("c3", "c", 3.0),
        ("c4", "d", 5.0),
    ]);
    let derived = odds(&source, true);
    let scheduler = source.scheduler().clone();
    assert_eq!(derived.case_ids(), ["c1", "c3", "c4"]);

    source
        .set_case_values(vec![NamedCase::with_id("c3").set("num", 4.0)])
        .unwrap();
    scheduler.run_until_idle();
    assert_eq!(derived.case_ids(), ["c1", "c4"]);

    source
        .set_case_values(vec![NamedCase::with_id("c3").set("num", 7.0)])
        .unwrap();
    scheduler.run_until_idle();
    assert_eq!(derived.case_ids(), ["c1", "c3", "c4"]);
    assert_eq!(derived.get_value("c3", "num"), Some(Value::from(7.0)));
    assert_eq!(derived.next_case_id("c1").as_deref(), Some("c3"));
    assert_eq!(derived.next_case_id("c3").as_deref(), Some("c4"));

    // Enter, leave and update in one batch.
    source
        .set_case_values(vec![
            NamedCase::with_id("c2").set("num", 9.0),
            NamedCase::with_id("c4").set("num", 6.0),
            NamedCase::with_id("c1").set("num", 11.0),
        ])
        .unwrap();
    scheduler.run_until_idle();
    assert_eq!(derived.case_ids(), ["c1", "c2", "c3"]);
    assert_eq!(numbers_of(&derived), [11.0, 9.0, 7.0]);
    assert_eq!(derived.case_count(), filtered_count(&source));
}

#[test]
fn updates_to_unprojected_attributes_still_reevaluate_membership() {
    let source = numbers(&[("c1", "a", 1.0)]);
    let derived = source
        .derive(
            None,
            DerivationSpec::new()
                .attributes(["num"])
                .filter(|case| case.value("str").as_text() == Some("keep"))
                .synchronized(),
        )
        .unwrap();
    assert_eq!(derived.case_count(), 0);

    source
        .set_case_values(vec![NamedCase::with_id("c1").set("str", "keep")])
        .unwrap();
    source.scheduler().run_until_idle();

    assert_eq!(derived.case_ids(), ["c1"]);
    assert_eq!(derived.get_value("c1", "num"), Some(Value::from(1.0)));
    assert!(derived.attr_from_id("str").is_none());
}

#[test]
fn removals_only_forward_member_cases() {
    let source = numbers(&[("c1", "a", 1.0), ("c2", "b", 2.0), ("c3", "c", 3.0)]);
    let derived = odds(&source, true);

    source.remove_cases(&["c2", "c3"]).unwrap();
    source.scheduler().run_until_idle();
    assert_eq!(derived.case_ids(), ["c1"]);
    assert_eq!(source.case_ids(), ["c1"]);
}

#[test]
fn attribute_changes_respect_the_projection() {
    let source = numbers(&[("c1", "a", 1.0), ("c2", "b", 2.0)]);
    let projected = odds(&source, true);
    let full = source
        .derive(None, DerivationSpec::new().filter(is_odd).synchronized())
        .unwrap();

    source
        .add_attribute_with_id(
            AttributeSnapshot::named("extra")
                .with_id("extra")
                .with_values(vec![Value::from(10.0), Value::from(20.0)]),
            Some("num"),
        )
        .unwrap();
    source.scheduler().run_until_idle();

    assert!(projected.attr_from_id("extra").is_none());
    let extra = full.attr_from_id("extra").unwrap();
    assert_eq!(extra.source_id.as_deref(), Some("extra"));
    assert_eq!(full.get_value("c1", "extra"), Some(Value::from(10.0)));
    let order: Vec<String> = full.attributes().into_iter().map(|a| a.id).collect();
    assert_eq!(order, ["str", "extra", "num"]);

    source.remove_attribute("num").unwrap();
    source.scheduler().run_until_idle();
    assert!(projected.attributes().is_empty());
    assert!(full.attr_from_id("num").is_none());

    source.remove_attribute("str").unwrap();
    source.scheduler().run_until_idle();
    assert!(full.attr_from_id("str").is_none());
}

#[test]
fn chained_derivations_settle_together() {
    let source = numbers(&[("c1", "a", 1.0), ("c2", "b", 3.0)]);
    let first = source
        .derive(Some("all"), DerivationSpec::new().synchronized())
        .unwrap();
    let second = odds(&first, true);
    assert_eq!(second.case_ids(), ["c1", "c2"]);

    source.remove_cases(&["c1"]).unwrap();
    source
        .add_cases_with_ids(
            &[NamedCase::with_id("c3").set("num", 5.0)],
            CaseInsertion::Append,
        )
        .unwrap();

    let done = second.on_synchronized();
    assert!(second.is_synchronizing());
    assert!(!done.is_complete());

    source.scheduler().run_until_idle();
    assert!(done.is_complete());
    assert_eq!(first.case_ids(), ["c2", "c3"]);
    assert_eq!(second.case_ids(), ["c2", "c3"]);
}

struct Flag(AtomicBool);

impl Wake for Flag {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn on_synchronized_future_wakes_when_in_flight_work_drains() {
    let source = numbers(&[("c1", "a", 1.0)]);
    let derived = odds(&source, true);
    let flag = Arc::new(Flag(AtomicBool::new(false)));
    let waker = Waker::from(flag.clone());
    let mut cx = Context::from_waker(&waker);

    let mut idle = derived.on_synchronized();
    assert_eq!(Pin::new(&mut idle).poll(&mut cx), Poll::Ready(()));

    source
        .set_case_values(vec![NamedCase::with_id("c1").set("num", 2.0)])
        .unwrap();
    let mut pending = derived.on_synchronized();
    assert_eq!(Pin::new(&mut pending).poll(&mut cx), Poll::Pending);
    assert!(!flag.0.load(Ordering::SeqCst));

    source.scheduler().run_until_idle();
    assert!(flag.0.load(Ordering::SeqCst));
    assert_eq!(Pin::new(&mut pending).poll(&mut cx), Poll::Ready(()));
    assert_eq!(derived.case_count(), 0);
}

#[test]
fn before_destroy_stops_following_and_is_idempotent() {
    let source = numbers(&[("c1", "a", 1.0)]);
    let derived = odds(&source, true);
    assert!(derived.is_subscribed_to_source());
    assert_eq!(source.interceptor_count(), 1);
    assert_eq!(source.observer_count(), 1);

    derived.before_destroy();
    derived.before_destroy();
    assert!(!derived.is_subscribed_to_source());
    assert_eq!(source.interceptor_count(), 0);
    assert_eq!(source.observer_count(), 0);

    source
        .add_cases_with_ids(&[NamedCase::with_id("c2").set("num", 3.0)], CaseInsertion::Append)
        .unwrap();
    source.scheduler().run_until_idle();
    assert_eq!(derived.case_ids(), ["c1"]);
}

struct KeepCases;

impl ActionInterceptor for KeepCases {
    fn intercept(&self, _data_set: &DataSet, action: &DataSetAction) -> ActionResult<Interception> {
        Ok(match action {
            DataSetAction::RemoveCases { .. } => Interception::Suppress,
            _ => Interception::Proceed,
        })
    }
}

#[test]
fn source_actions_suppressed_downstream_never_reach_the_derived_store() {
    let source = numbers(&[("c1", "a", 1.0)]);
    let derived = odds(&source, true);
    source.add_interceptor(Rc::new(KeepCases));

    source.remove_cases(&["c1"]).unwrap();
    assert!(!derived.is_synchronizing());
    source.scheduler().run_until_idle();
    assert_eq!(source.case_ids(), ["c1"]);
    assert_eq!(derived.case_ids(), ["c1"]);

    // Later actions still remap against the real membership.
    source
        .add_cases_with_ids(
            &[NamedCase::with_id("c0").set("num", 5.0)],
            CaseInsertion::Before("c1".to_string()),
        )
        .unwrap();
    source.scheduler().run_until_idle();
    assert_eq!(derived.case_ids(), ["c0", "c1"]);
}

#[test]
fn numeric_text_input_is_filtered_as_a_number() {
    let source = numbers(&[("c1", "a", 2.0)]);
    let derived = odds(&source, true);

    source
        .add_cases_with_ids(
            &[
                NamedCase::with_id("t3").set("num", "3"),
                NamedCase::with_id("t4").set("num", " 4 "),
                NamedCase::with_id("tx").set("num", "three"),
            ],
            CaseInsertion::Append,
        )
        .unwrap();
    source.scheduler().run_until_idle();

    assert_eq!(source.get_value("t3", "num"), Some(Value::from(3.0)));
    assert_eq!(source.get_value("tx", "num"), Some(Value::text("three")));
    assert_eq!(derived.case_ids(), ["t3"]);
    assert_eq!(filtered_count(&source), 1);
}

#[test]
fn many_unflushed_batches_converge_to_the_filtered_source() {
    let source = numbers(&[]);
    let derived = odds(&source, true);

    for round in 0_i32..6 {
        let id = format!("n{round}");
        let before = source.case_ids().first().cloned();
        let insertion = match before {
            Some(first) if round % 2 == 0 => CaseInsertion::Before(first),
            _ => CaseInsertion::Append,
        };
        source
            .add_cases_with_ids(
                &[NamedCase::with_id(id.as_str()).set("num", f64::from(round))],
                insertion,
            )
            .unwrap();
    }
    source
        .set_case_values(vec![NamedCase::with_id("n3").set("num", 8.0)])
        .unwrap();
    source.remove_cases(&["n1"]).unwrap();

    source.scheduler().run_until_idle();
    assert!(derived.on_synchronized().is_complete());

    let expected: Vec<String> = source
        .case_ids()
        .into_iter()
        .filter(|case_id| source.get_case(case_id).is_some_and(|case| is_odd(&case)))
        .collect();
    assert_eq!(derived.case_ids(), expected);
    assert_eq!(derived.case_count(), filtered_count(&source));
}
