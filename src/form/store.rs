//! Keyed arenas behind the controller lock.
//!
//! `FieldStore` and `FormStore` live side by side in one `StoreState`, so a
//! registration touches both under a single write and no reader ever sees a
//! field without its id in the owning form (or the reverse).

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::controller::{
    FieldId, FieldKey, FieldMeta, FieldOptions, FormError, FormId, FormOptions, FormResult,
    FormSnapshot,
};
use super::guard::{EffectGuard, GuardScope};
use super::submission::{SubmissionTicket, SubmitHandlerFn, TrackedSubmission};
use super::validation::{FieldBag, ValidationHandle, ValidatorFn};
use super::value::{FieldError, FieldValue, ValueMap};

pub(super) struct FieldRecord {
    pub(super) id: FieldId,
    pub(super) value: FieldValue,
    pub(super) default_value: FieldValue,
    pub(super) touched: bool,
    pub(super) required: bool,
    pub(super) label: Option<String>,
    pub(super) debounce: Duration,
    pub(super) validator: Option<ValidatorFn>,
    pub(super) error: Option<FieldError>,
    pub(super) pending: Option<ValidationHandle>,
    pub(super) scope: GuardScope,
}

impl FieldRecord {
    fn new(id: FieldId, default_value: FieldValue, options: FieldOptions) -> Self {
        Self {
            id,
            value: default_value.clone(),
            default_value,
            touched: false,
            required: options.required,
            label: options.label,
            debounce: options.debounce,
            validator: options.validator,
            error: None,
            pending: None,
            scope: GuardScope::new(),
        }
    }

    pub(super) fn meta(&self) -> FieldMeta {
        FieldMeta {
            name: self.id.name.clone(),
            value: self.value.clone(),
            default_value: self.default_value.clone(),
            label: self.label.clone(),
            required: self.required,
            touched: self.touched,
            dirty: self.value != self.default_value,
            validating: self.pending.is_some(),
            error: self.error.clone(),
        }
    }

    pub(super) fn settle(&mut self, error: Option<FieldError>) -> EffectGuard {
        let guard = self.scope.begin();
        self.error = error;
        self.pending = None;
        guard
    }
}

#[derive(Default)]
pub(super) struct FieldStore {
    records: BTreeMap<FieldId, FieldRecord>,
}

impl FieldStore {
    pub(super) fn get(&self, id: &FieldId) -> Option<&FieldRecord> {
        self.records.get(id)
    }

    pub(super) fn get_mut(&mut self, id: &FieldId) -> Option<&mut FieldRecord> {
        self.records.get_mut(id)
    }

    pub(super) fn update<R>(
        &mut self,
        id: &FieldId,
        f: impl FnOnce(&mut FieldRecord) -> R,
    ) -> Option<R> {
        self.records.get_mut(id).map(f)
    }

    fn insert(&mut self, record: FieldRecord) {
        self.records.insert(record.id.clone(), record);
    }

    fn remove(&mut self, id: &FieldId) -> Option<FieldRecord> {
        let record = self.records.remove(id)?;
        record.scope.teardown();
        Some(record)
    }
}

pub(super) struct FormRecord {
    pub(super) id: FormId,
    pub(super) field_ids: Vec<FieldKey>,
    pub(super) options: FormOptions,
    pub(super) submit_handler: Option<SubmitHandlerFn>,
    pub(super) submission: Option<TrackedSubmission>,
    pub(super) last_ticket: Option<SubmissionTicket>,
    pub(super) submit_count: u32,
}

impl FormRecord {
    fn new(id: FormId) -> Self {
        Self {
            id,
            field_ids: Vec::new(),
            options: FormOptions::default(),
            submit_handler: None,
            submission: None,
            last_ticket: None,
            submit_count: 0,
        }
    }

    pub(super) fn field_id(&self, name: &FieldKey) -> FieldId {
        FieldId::new(self.id.clone(), name.clone())
    }
}

#[derive(Default)]
pub(super) struct FormStore {
    records: BTreeMap<FormId, FormRecord>,
}

impl FormStore {
    pub(super) fn ensure(&mut self, id: &FormId) -> &mut FormRecord {
        self.records
            .entry(id.clone())
            .or_insert_with(|| FormRecord::new(id.clone()))
    }

    pub(super) fn get(&self, id: &FormId) -> Option<&FormRecord> {
        self.records.get(id)
    }

    pub(super) fn get_mut(&mut self, id: &FormId) -> Option<&mut FormRecord> {
        self.records.get_mut(id)
    }

    fn remove(&mut self, id: &FormId) -> Option<FormRecord> {
        self.records.remove(id)
    }
}

pub(super) struct Capture {
    pub(super) field_ids: Vec<FieldKey>,
    pub(super) values: ValueMap,
    pub(super) touched: BTreeMap<FieldKey, bool>,
}

#[derive(Default)]
pub(super) struct StoreState {
    pub(super) forms: FormStore,
    pub(super) fields: FieldStore,
    next_ticket: u64,
}

impl StoreState {
    pub(super) fn next_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    pub(super) fn is_latest_submission(
        &self,
        form_id: &FormId,
        ticket: SubmissionTicket,
    ) -> bool {
        self.forms
            .get(form_id)
            .is_some_and(|form| form.last_ticket == Some(ticket))
    }

    pub(super) fn register(
        &mut self,
        form_id: &FormId,
        options: FieldOptions,
    ) -> FormResult<FieldId> {
        let form = self.forms.ensure(form_id);
        if form.field_ids.contains(&options.name) {
            return Err(FormError::DuplicateField {
                form: form_id.clone(),
                name: options.name,
            });
        }
        let default_value = form
            .options
            .initial_values
            .get(&options.name)
            .cloned()
            .unwrap_or_else(|| options.default_value.clone());
        form.field_ids.push(options.name.clone());
        let id = form.field_id(&options.name);
        self.fields
            .insert(FieldRecord::new(id.clone(), default_value, options));
        Ok(id)
    }

    pub(super) fn deregister(&mut self, id: &FieldId) -> Option<FieldRecord> {
        if let Some(form) = self.forms.get_mut(&id.form) {
            form.field_ids.retain(|name| name != &id.name);
        }
        self.fields.remove(id)
    }

    pub(super) fn remove_form(&mut self, form_id: &FormId) -> Option<FormRecord> {
        let form = self.forms.remove(form_id)?;
        for name in &form.field_ids {
            self.fields.remove(&form.field_id(name));
        }
        Some(form)
    }

    pub(super) fn bag(&self, id: &FieldId) -> FieldBag {
        let mut bag = FieldBag::default();
        for record in self.records_of(&id.form) {
            if record.id.name == id.name {
                continue;
            }
            bag.values
                .insert(record.id.name.clone(), record.value.clone());
            bag.touched.insert(record.id.name.clone(), record.touched);
        }
        bag
    }

    pub(super) fn capture(&self, form_id: &FormId) -> Capture {
        let mut capture = Capture {
            field_ids: Vec::new(),
            values: ValueMap::new(),
            touched: BTreeMap::new(),
        };
        for record in self.records_of(form_id) {
            capture.field_ids.push(record.id.name.clone());
            capture
                .values
                .insert(record.id.name.clone(), record.value.clone());
            capture
                .touched
                .insert(record.id.name.clone(), record.touched);
        }
        capture
    }

    pub(super) fn pending_of(&self, form_id: &FormId) -> Vec<ValidationHandle> {
        self.records_of(form_id)
            .filter_map(|record| record.pending.clone())
            .collect()
    }

    pub(super) fn outcomes_of(&self, form_id: &FormId) -> Vec<(FieldKey, Option<FieldError>)> {
        self.records_of(form_id)
            .map(|record| (record.id.name.clone(), record.error.clone()))
            .collect()
    }

    pub(super) fn snapshot(&self, form_id: &FormId) -> FormSnapshot {
        let form = self.forms.get(form_id);
        let mut snapshot = FormSnapshot {
            form_id: form_id.clone(),
            field_ids: Vec::new(),
            values: ValueMap::new(),
            errors: BTreeMap::new(),
            touched: BTreeMap::new(),
            validating: BTreeSet::new(),
            fields: BTreeMap::new(),
            is_submitting: form.is_some_and(|form| form.submission.is_some()),
            submit_count: form.map_or(0, |form| form.submit_count),
        };
        for record in self.records_of(form_id) {
            let name = record.id.name.clone();
            snapshot.field_ids.push(name.clone());
            snapshot.values.insert(name.clone(), record.value.clone());
            snapshot.touched.insert(name.clone(), record.touched);
            if let Some(error) = &record.error {
                snapshot.errors.insert(name.clone(), error.clone());
            }
            if record.pending.is_some() {
                snapshot.validating.insert(name.clone());
            }
            snapshot.fields.insert(name, record.meta());
        }
        snapshot
    }

    pub(super) fn records_of<'a>(
        &'a self,
        form_id: &FormId,
    ) -> impl Iterator<Item = &'a FieldRecord> + 'a {
        let form = self.forms.get(form_id);
        form.into_iter().flat_map(move |form| {
            form.field_ids
                .iter()
                .filter_map(move |name| self.fields.get(&form.field_id(name)))
        })
    }
}
