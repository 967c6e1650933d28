//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `casetable_core` linkage.
//! - Walk one derived view and one remote round trip with deterministic
//!   output for quick local sanity checks.
//!
//! Set `CASETABLE_LOG_DIR` to an absolute path to also write core logs.

use casetable_core::{
    default_log_level, init_logging, ping, AttributeSnapshot, CaseInsertion, DataSet,
    DataSetOptions, DerivationSpec, MemoryRemoteStore, NamedCase, RemoteSync, RemoteSyncOptions,
    Scheduler, SequentialIdGenerator,
};
use std::error::Error;
use std::process::ExitCode;
use std::rc::Rc;

fn main() -> ExitCode {
    if let Ok(log_dir) = std::env::var("CASETABLE_LOG_DIR") {
        if let Err(err) = init_logging(default_log_level(), &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    println!("casetable_core ping={}", ping());
    println!("casetable_core version={}", casetable_core::core_version());
    match run_demo() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("event=cli_demo module=cli status=error error={err}");
            eprintln!("demo failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run_demo() -> Result<(), Box<dyn Error>> {
    let scheduler = Scheduler::new();
    let source = DataSet::new(
        DataSetOptions::default()
            .with_name("numbers")
            .with_id_generator(Rc::new(SequentialIdGenerator::new("demo-")))
            .with_scheduler(scheduler.clone()),
    );
    source.add_attribute_with_id(AttributeSnapshot::named("str").with_id("str"), None)?;
    source.add_attribute_with_id(AttributeSnapshot::named("num").with_id("num"), None)?;
    let rows = [("a", 1.0), ("b", 2.0), ("c", 3.0)];
    let cases: Vec<NamedCase> = rows
        .iter()
        .map(|(text, number)| NamedCase::new().set("str", *text).set("num", *number))
        .collect();
    source.add_cases_to_data_set(&cases, CaseInsertion::Append)?;

    let odds = source.derive(
        Some("odds"),
        DerivationSpec::new()
            .attributes(["num"])
            .filter(|case| {
                case.value("num")
                    .as_number()
                    .is_some_and(|number| number % 2.0 == 1.0)
            })
            .synchronized(),
    )?;
    print_numbers("odds", &odds);

    let new_ids = source.add_cases_to_data_set(
        &[NamedCase::new().set("str", "d").set("num", 5.0)],
        CaseInsertion::Append,
    )?;
    scheduler.run_until_idle();
    print_numbers("odds after adding 5", &odds);

    if let Some(first) = new_ids.first() {
        source.set_case_values(vec![NamedCase::with_id(first.clone()).set("num", 6.0)])?;
    }
    scheduler.run_until_idle();
    print_numbers("odds after 5 -> 6", &odds);

    let store = Rc::new(MemoryRemoteStore::new(scheduler.clone()));
    let sync = RemoteSync::attach(&source, store.clone(), RemoteSyncOptions::default())?;
    let writes_after_seed = store.write_count();
    source.set_attribute_name("str", "label")?;
    scheduler.run_until_idle();
    println!(
        "remote root={} writes_for_rename={} label_present={}",
        sync.root(),
        store.write_count() - writes_after_seed,
        source.attr_from_name("label").is_some()
    );

    sync.detach();
    odds.before_destroy();
    Ok(())
}

fn print_numbers(label: &str, data_set: &DataSet) {
    let numbers: Vec<String> = data_set
        .case_ids()
        .iter()
        .filter_map(|case_id| data_set.get_value(case_id, "num"))
        .map(|value| value.to_string())
        .collect();
    println!("{label}: [{}]", numbers.join(", "));
}
