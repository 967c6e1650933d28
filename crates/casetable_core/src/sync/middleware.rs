//! Remote sync middleware: keeps a data set consistent with a shared remote
//! store.
//!
//! # Responsibility
//! - Redirect local structural and value edits to the remote store instead of
//!   applying them locally.
//! - Replay remote child events as the equivalent local actions.
//! - Populate the data set from the remote regions on attach, or publish the
//!   local content when the remote root is still empty.
//!
//! # Invariants
//! - An action seen while a remote change is being applied is applied
//!   locally and never forwarded, so one local edit causes exactly one remote
//!   write and its echo causes none.
//! - A forwarded edit reaches local state only through its echo.
//! - A read-only data set drops local edits without writing.
//! - A failed remote write leaves local state untouched and is returned to
//!   the caller of the local action.

use crate::dataset::{DataSet, WeakDataSet};
use crate::error::{ActionError, ActionResult};
use crate::model::attribute::AttributeSnapshot;
use crate::model::case::CanonicalCase;
use crate::model::ids::AttributeId;
use crate::model::table::Table;
use crate::model::value::Value;
use crate::pipeline::action::{CaseInsertion, DataSetAction};
use crate::pipeline::chain::{ActionInterceptor, Interception, SubscriptionId};
use crate::sync::error::{RemoteError, RemoteResult};
use crate::sync::phase::{PendingWrite, Region, SyncPhase};
use crate::sync::remote_store::{
    ListenerId, RemoteEvent, RemoteListener, RemoteRecord, RemoteStore,
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

const PROPERTY_ID: &str = "id";
const PROPERTY_NAME: &str = "name";

/// Attach-time configuration.
#[derive(Debug, Clone)]
pub struct RemoteSyncOptions {
    /// Region root; defaults to `datasets/<data set id>`.
    pub root: Option<String>,
    /// Publish local content when the remote root is empty.
    pub seed_from_local: bool,
}

impl Default for RemoteSyncOptions {
    fn default() -> Self {
        Self {
            root: None,
            seed_from_local: true,
        }
    }
}

impl RemoteSyncOptions {
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn seed_from_local(mut self, seed: bool) -> Self {
        self.seed_from_local = seed;
        self
    }
}

/// Stored shape of one attribute child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AttributeRecord {
    id: AttributeId,
    name: String,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    units: String,
    #[serde(default)]
    formula: String,
}

impl AttributeRecord {
    fn from_snapshot(id: &str, snapshot: &AttributeSnapshot) -> Self {
        Self {
            id: id.to_string(),
            name: snapshot.name.clone(),
            hidden: snapshot.hidden,
            units: snapshot.units.clone(),
            formula: snapshot.formula.clone(),
        }
    }

    fn into_snapshot(self) -> AttributeSnapshot {
        AttributeSnapshot {
            id: Some(self.id),
            source_id: None,
            name: self.name,
            hidden: self.hidden,
            units: self.units,
            formula: self.formula,
            values: Vec::new(),
        }
    }
}

/// Remote key <-> attribute id mapping.
#[derive(Debug, Default)]
struct AttributeKeys {
    by_id: HashMap<AttributeId, String>,
    by_key: HashMap<String, AttributeId>,
}

impl AttributeKeys {
    fn insert(&mut self, key: &str, attribute_id: &str) {
        self.by_id.insert(attribute_id.to_string(), key.to_string());
        self.by_key.insert(key.to_string(), attribute_id.to_string());
    }

    fn key_for(&self, attribute_id: &str) -> Option<&str> {
        self.by_id.get(attribute_id).map(String::as_str)
    }

    fn remove_key(&mut self, key: &str) -> Option<AttributeId> {
        let attribute_id = self.by_key.remove(key)?;
        self.by_id.remove(&attribute_id);
        Some(attribute_id)
    }
}

/// One planned remote write.
#[derive(Debug)]
enum RemoteWrite {
    PushAttribute {
        attribute_id: AttributeId,
        record: JsonValue,
    },
    Set {
        region: Region,
        key: String,
        value: JsonValue,
    },
    Update {
        region: Region,
        key: String,
        fields: Map<String, JsonValue>,
    },
}

/// Handle to an attached middleware instance.
pub struct RemoteSync {
    core: Rc<SyncCore>,
}

struct SyncCore {
    data_set: WeakDataSet,
    store: Rc<dyn RemoteStore>,
    root: String,
    phase: RefCell<SyncPhase>,
    keys: RefCell<AttributeKeys>,
    subscription: Cell<Option<SubscriptionId>>,
    listeners: RefCell<Vec<ListenerId>>,
    detached: Cell<bool>,
}

impl RemoteSync {
    /// Attaches `data_set` to the remote regions under the configured root.
    ///
    /// Reads all three regions first. A remote root with content populates
    /// the data set as if each record arrived as an add; an empty root is
    /// seeded from local content when `seed_from_local` is set. Live deltas
    /// are delivered through the data set's scheduler afterwards.
    pub fn attach(
        data_set: &DataSet,
        store: Rc<dyn RemoteStore>,
        options: RemoteSyncOptions,
    ) -> RemoteResult<RemoteSync> {
        let root = options
            .root
            .clone()
            .unwrap_or_else(|| format!("datasets/{}", data_set.id()));
        let core = Rc::new(SyncCore {
            data_set: data_set.downgrade(),
            store,
            root,
            phase: RefCell::new(SyncPhase::Idle),
            keys: RefCell::new(AttributeKeys::default()),
            subscription: Cell::new(None),
            listeners: RefCell::new(Vec::new()),
            detached: Cell::new(false),
        });

        let properties = core.store.get(&core.path(Region::Properties))?;
        let attributes = core.store.get(&core.path(Region::Attributes))?;
        let cases = core.store.get(&core.path(Region::Cases))?;
        let remote_empty = properties.is_empty() && attributes.is_empty() && cases.is_empty();
        let local_has_content = data_set.with_table(|table| {
            !table.attributes().is_empty() || table.case_count() > 0
        });

        let mode = if remote_empty && local_has_content && options.seed_from_local {
            core.seed_from(data_set)?;
            "seed"
        } else {
            if properties.is_empty() {
                core.write_properties(data_set)?;
            }
            core.replay(data_set, Region::Properties, properties);
            core.replay(data_set, Region::Attributes, attributes);
            core.replay(data_set, Region::Cases, cases);
            "replay"
        };

        let interceptor: Rc<dyn ActionInterceptor> = core.clone();
        core.subscription
            .set(Some(data_set.prepend_interceptor(interceptor)));
        let listener: Rc<dyn RemoteListener> = core.clone();
        let listener_ids: Vec<ListenerId> = Region::ALL
            .iter()
            .map(|region| {
                core.store
                    .listen(&core.path(*region), Rc::downgrade(&listener))
            })
            .collect();
        *core.listeners.borrow_mut() = listener_ids;

        info!(
            "event=remote_attach module=remote_sync status=ok data_set={} root={} mode={} attributes={} cases={}",
            data_set.id(),
            core.root,
            mode,
            data_set.with_table(|table| table.attributes().len()),
            data_set.case_count()
        );
        Ok(RemoteSync { core })
    }

    pub fn root(&self) -> &str {
        &self.core.root
    }

    /// Local writes whose echo has not been applied yet.
    pub fn pending_echoes(&self) -> usize {
        self.core.phase.borrow().pending()
    }

    pub fn is_applying_remote(&self) -> bool {
        self.core.phase.borrow().is_applying_remote()
    }

    pub fn is_attached(&self) -> bool {
        !self.core.detached.get()
    }

    /// Stops listening and removes the interceptor. Idempotent.
    pub fn detach(&self) {
        self.core.detach();
    }
}

impl SyncCore {
    fn path(&self, region: Region) -> String {
        format!("{}/{}", self.root, region.as_str())
    }

    fn region_of(&self, path: &str) -> Option<Region> {
        let name = path.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        Region::ALL
            .into_iter()
            .find(|region| region.as_str() == name)
    }

    fn detach(&self) {
        if self.detached.replace(true) {
            return;
        }
        for listener_id in self.listeners.borrow_mut().drain(..) {
            self.store.unlisten(listener_id);
        }
        if let (Some(data_set), Some(subscription)) =
            (self.data_set.upgrade(), self.subscription.take())
        {
            data_set.unsubscribe(subscription);
        }
        info!(
            "event=remote_detach module=remote_sync status=ok root={}",
            self.root
        );
    }

    fn write_properties(&self, data_set: &DataSet) -> RemoteResult<()> {
        let path = self.path(Region::Properties);
        self.store
            .set(&path, PROPERTY_ID, JsonValue::String(data_set.id()))?;
        self.store
            .set(&path, PROPERTY_NAME, JsonValue::String(data_set.name()))?;
        Ok(())
    }

    /// Publishes the whole local table. Runs before listening, so these
    /// writes produce no echoes for this instance.
    fn seed_from(&self, data_set: &DataSet) -> RemoteResult<()> {
        self.write_properties(data_set)?;
        let (attributes, cases) = data_set.with_table(|table| {
            let attributes: Vec<(AttributeId, JsonValue)> = table
                .attributes()
                .iter()
                .map(|attribute| {
                    let record = AttributeRecord {
                        id: attribute.id.clone(),
                        name: attribute.name.clone(),
                        hidden: attribute.hidden,
                        units: attribute.units.clone(),
                        formula: attribute.formula.clone(),
                    };
                    serde_json::to_value(record).map(|value| (attribute.id.clone(), value))
                })
                .collect::<Result<_, _>>()?;
            let cases: Vec<(String, JsonValue)> = table
                .case_ids()
                .iter()
                .filter_map(|case_id| table.canonical_case(case_id))
                .filter_map(|case| {
                    let payload = case_payload(&case);
                    case.id.map(|case_id| (case_id, payload))
                })
                .collect();
            Ok::<_, RemoteError>((attributes, cases))
        })?;

        let attribute_path = self.path(Region::Attributes);
        for (attribute_id, record) in attributes {
            let key = self.store.push(&attribute_path, record)?;
            self.keys.borrow_mut().insert(&key, &attribute_id);
        }
        let case_path = self.path(Region::Cases);
        for (case_id, payload) in cases {
            self.store.set(&case_path, &case_id, payload)?;
        }
        Ok(())
    }

    fn replay(&self, data_set: &DataSet, region: Region, records: Vec<RemoteRecord>) {
        for record in records {
            self.dispatch(data_set, region, RemoteEvent::Added(record));
        }
    }

    fn dispatch(&self, data_set: &DataSet, region: Region, event: RemoteEvent) {
        let actions = match region {
            Region::Properties => {
                self.adopt_property(data_set, &event);
                return;
            }
            Region::Attributes => {
                data_set.with_table(|table| self.translate_attribute(table, &event))
            }
            Region::Cases => data_set.with_table(|table| self.translate_case(table, &event)),
        };
        if actions.is_empty() {
            return;
        }

        let entered = self.phase.borrow_mut().begin_remote();
        for action in actions {
            let name = action.name();
            if let Err(err) = data_set.apply_action(action) {
                debug!(
                    "event=remote_apply module=remote_sync status=skip action={} error={}",
                    name, err
                );
            }
        }
        if entered {
            self.phase.borrow_mut().end_remote();
        }
    }

    fn adopt_property(&self, data_set: &DataSet, event: &RemoteEvent) {
        let (RemoteEvent::Added(record) | RemoteEvent::Changed(record)) = event else {
            return;
        };
        if record.key != PROPERTY_NAME {
            return;
        }
        match record.value.as_str() {
            Some(name) => data_set.set_name_from_remote(name),
            None => self.warn_invalid(Region::Properties, &record.key, "name is not a string"),
        }
    }

    fn translate_attribute(&self, table: &Table, event: &RemoteEvent) -> Vec<DataSetAction> {
        match event {
            RemoteEvent::Added(record) | RemoteEvent::Changed(record) => {
                let parsed: AttributeRecord = match serde_json::from_value(record.value.clone()) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        self.warn_invalid(Region::Attributes, &record.key, &err.to_string());
                        return Vec::new();
                    }
                };
                self.keys.borrow_mut().insert(&record.key, &parsed.id);
                match table.attribute(&parsed.id) {
                    Some(existing) if existing.name != parsed.name => {
                        vec![DataSetAction::SetAttributeName {
                            attribute_id: parsed.id,
                            name: parsed.name,
                        }]
                    }
                    Some(_) => Vec::new(),
                    None => vec![DataSetAction::AddAttribute {
                        snapshot: parsed.into_snapshot(),
                        before_id: None,
                    }],
                }
            }
            RemoteEvent::Removed { key } => match self.keys.borrow_mut().remove_key(key) {
                Some(attribute_id) => vec![DataSetAction::RemoveAttribute { attribute_id }],
                None => Vec::new(),
            },
        }
    }

    fn translate_case(&self, table: &Table, event: &RemoteEvent) -> Vec<DataSetAction> {
        match event {
            RemoteEvent::Added(record) | RemoteEvent::Changed(record) => {
                let Some(fields) = record.value.as_object() else {
                    self.warn_invalid(Region::Cases, &record.key, "case payload is not an object");
                    return Vec::new();
                };
                let mut case = CanonicalCase::with_id(record.key.clone());
                for (attribute_id, cell) in fields {
                    match Value::from_json(cell) {
                        Some(value) => {
                            case.values.insert(attribute_id.clone(), value);
                        }
                        None => self.warn_invalid(
                            Region::Cases,
                            &record.key,
                            &format!("unsupported value for `{attribute_id}`"),
                        ),
                    }
                }

                if table.contains_case(&record.key) {
                    // Full record: attributes missing remotely are cleared.
                    for attribute in table.attributes() {
                        case.values.entry(attribute.id.clone()).or_default();
                    }
                    vec![DataSetAction::SetCanonicalCaseValues { cases: vec![case] }]
                } else {
                    vec![DataSetAction::AddCases {
                        cases: vec![case],
                        before: CaseInsertion::Append,
                    }]
                }
            }
            RemoteEvent::Removed { key } => vec![DataSetAction::RemoveCases {
                case_ids: vec![key.clone()],
            }],
        }
    }

    fn warn_invalid(&self, region: Region, key: &str, message: &str) {
        warn!(
            "event=remote_record module=remote_sync status=skip root={} region={} key={} reason={}",
            self.root,
            region.as_str(),
            key,
            message
        );
    }

    /// Translates one local action into remote writes.
    fn plan_writes(&self, table: &Table, action: &DataSetAction) -> Vec<RemoteWrite> {
        match action {
            DataSetAction::AddAttribute { snapshot, .. } => {
                let Some(attribute_id) = snapshot.id.as_deref() else {
                    return Vec::new();
                };
                if table.attribute(attribute_id).is_some()
                    || table.attribute_by_name(&snapshot.name).is_some()
                    || self.keys.borrow().key_for(attribute_id).is_some()
                {
                    return Vec::new();
                }
                let record = match serde_json::to_value(AttributeRecord::from_snapshot(
                    attribute_id,
                    snapshot,
                )) {
                    Ok(record) => record,
                    Err(err) => {
                        error!(
                            "event=remote_forward module=remote_sync status=error error_code=serialize error={err}"
                        );
                        return Vec::new();
                    }
                };
                let mut writes = vec![RemoteWrite::PushAttribute {
                    attribute_id: attribute_id.to_string(),
                    record,
                }];
                for (case_id, value) in table.case_ids().iter().zip(&snapshot.values) {
                    if value.is_absent() {
                        continue;
                    }
                    let mut fields = Map::new();
                    fields.insert(attribute_id.to_string(), value.to_json());
                    writes.push(RemoteWrite::Update {
                        region: Region::Cases,
                        key: case_id.clone(),
                        fields,
                    });
                }
                writes
            }
            DataSetAction::RemoveAttribute { attribute_id } => self
                .keys
                .borrow()
                .key_for(attribute_id)
                .map(|key| RemoteWrite::Set {
                    region: Region::Attributes,
                    key: key.to_string(),
                    value: JsonValue::Null,
                })
                .into_iter()
                .collect(),
            DataSetAction::SetAttributeName { attribute_id, name } => {
                // Covers renaming to the current name too.
                if table.attribute_by_name(name).is_some() {
                    return Vec::new();
                }
                let keys = self.keys.borrow();
                let Some(key) = keys.key_for(attribute_id) else {
                    return Vec::new();
                };
                let mut fields = Map::new();
                fields.insert(PROPERTY_NAME.to_string(), JsonValue::String(name.clone()));
                vec![RemoteWrite::Update {
                    region: Region::Attributes,
                    key: key.to_string(),
                    fields,
                }]
            }
            DataSetAction::AddCases { cases, .. } => {
                let mut seen = HashSet::new();
                cases
                    .iter()
                    .filter_map(|case| {
                        let case_id = case.id.as_ref()?;
                        if table.contains_case(case_id) || !seen.insert(case_id.clone()) {
                            return None;
                        }
                        Some(RemoteWrite::Set {
                            region: Region::Cases,
                            key: case_id.clone(),
                            value: case_payload(&known_values(table, case)),
                        })
                    })
                    .collect()
            }
            DataSetAction::SetCaseValues { cases } => {
                let canonical: Vec<CanonicalCase> =
                    cases.iter().map(|case| table.canonicalize(case)).collect();
                value_updates(table, &canonical, &self.phase.borrow())
            }
            DataSetAction::SetCanonicalCaseValues { cases } => {
                value_updates(table, cases, &self.phase.borrow())
            }
            DataSetAction::RemoveCases { case_ids } => {
                let mut seen = HashSet::new();
                case_ids
                    .iter()
                    .filter(|case_id| table.contains_case(case_id) && seen.insert((*case_id).clone()))
                    .map(|case_id| RemoteWrite::Set {
                        region: Region::Cases,
                        key: case_id.clone(),
                        value: JsonValue::Null,
                    })
                    .collect()
            }
            DataSetAction::MoveAttribute { .. } => Vec::new(),
        }
    }

    fn perform(&self, write: RemoteWrite) -> RemoteResult<()> {
        let pending = match write {
            RemoteWrite::PushAttribute {
                attribute_id,
                record,
            } => {
                let key = self.store.push(&self.path(Region::Attributes), record)?;
                self.keys.borrow_mut().insert(&key, &attribute_id);
                PendingWrite {
                    region: Region::Attributes,
                    key,
                }
            }
            RemoteWrite::Set { region, key, value } => {
                if !self.store.set(&self.path(region), &key, value)? {
                    return Ok(());
                }
                PendingWrite { region, key }
            }
            RemoteWrite::Update {
                region,
                key,
                fields,
            } => {
                if !self.store.update(&self.path(region), &key, fields)? {
                    return Ok(());
                }
                PendingWrite { region, key }
            }
        };
        // Only writes that changed the remote come back as echoes.
        self.phase.borrow_mut().record_write(pending);
        Ok(())
    }
}

impl ActionInterceptor for SyncCore {
    fn intercept(&self, data_set: &DataSet, action: &DataSetAction) -> ActionResult<Interception> {
        if self.phase.borrow().is_applying_remote() {
            return Ok(Interception::Proceed);
        }
        // Column order is local presentation state.
        if matches!(action, DataSetAction::MoveAttribute { .. }) {
            return Ok(Interception::Proceed);
        }
        if data_set.is_read_only() {
            debug!(
                "event=remote_forward module=remote_sync status=skip reason=read_only data_set={} action={}",
                data_set.id(),
                action.name()
            );
            return Ok(Interception::Suppress);
        }

        let writes = data_set.with_table(|table| self.plan_writes(table, action));
        let planned = writes.len();
        for write in writes {
            if let Err(err) = self.perform(write) {
                error!(
                    "event=remote_forward module=remote_sync status=error data_set={} action={} root={} error={}",
                    data_set.id(),
                    action.name(),
                    self.root,
                    err
                );
                return Err(ActionError::Remote(err));
            }
        }
        debug!(
            "event=remote_forward module=remote_sync status=ok data_set={} action={} writes={}",
            data_set.id(),
            action.name(),
            planned
        );
        Ok(Interception::Suppress)
    }
}

impl RemoteListener for SyncCore {
    fn on_remote_event(&self, path: &str, event: RemoteEvent) {
        if self.detached.get() {
            return;
        }
        let Some(region) = self.region_of(path) else {
            return;
        };
        let Some(data_set) = self.data_set.upgrade() else {
            self.detach();
            return;
        };
        if data_set.is_destroyed() {
            self.detach();
            return;
        }

        let echo = self.phase.borrow_mut().acknowledge(region, event.key());
        debug!(
            "event=remote_event module=remote_sync status=ok data_set={} region={} key={} kind={} echo={}",
            data_set.id(),
            region.as_str(),
            event.key(),
            event.kind(),
            echo
        );

        self.dispatch(&data_set, region, event);
    }
}

/// Case values restricted to attributes the table knows.
fn known_values(table: &Table, case: &CanonicalCase) -> CanonicalCase {
    CanonicalCase {
        id: case.id.clone(),
        values: case
            .values
            .iter()
            .filter(|(attribute_id, _)| table.attribute(attribute_id).is_some())
            .map(|(attribute_id, value)| (attribute_id.clone(), value.clone()))
            .collect(),
    }
}

/// Remote payload of a case: present values only, keyed by attribute id.
fn case_payload(case: &CanonicalCase) -> JsonValue {
    JsonValue::Object(
        case.values
            .iter()
            .filter(|(_, value)| !value.is_absent())
            .map(|(attribute_id, value)| (attribute_id.clone(), value.to_json()))
            .collect(),
    )
}

/// Field updates for `cases`. Values equal to the local ones are dropped
/// unless the case still awaits an echo, since local state then lags the
/// remote.
fn value_updates(
    table: &Table,
    cases: &[CanonicalCase],
    phase: &SyncPhase,
) -> Vec<RemoteWrite> {
    cases
        .iter()
        .filter_map(|case| {
            let case_id = case.id.as_ref()?;
            if !table.contains_case(case_id) {
                return None;
            }
            let settled = !phase.is_awaiting(Region::Cases, case_id);
            let fields: Map<String, JsonValue> = known_values(table, case)
                .values
                .into_iter()
                .filter(|(attribute_id, value)| {
                    !settled || table.value(case_id, attribute_id) != Some(value)
                })
                .map(|(attribute_id, value)| (attribute_id, value.to_json()))
                .collect();
            (!fields.is_empty()).then(|| RemoteWrite::Update {
                region: Region::Cases,
                key: case_id.clone(),
                fields,
            })
        })
        .collect()
}
