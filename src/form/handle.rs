use std::collections::BTreeMap;

use super::controller::{
    FieldKey, FieldMeta, FieldOptions, FormController, FormError, FormEvent, FormId, FormResult,
    FormSnapshot, SubscriptionId,
};
use super::submission::{SubmissionHandle, SubmitHandler};
use super::validation::{FieldValidator, ValidationHandle};
use super::value::{FieldError, FieldValue, FormValues, ValueMap};

/// A controller bound to one form id. Submit handlers receive one as their
/// mutation bag.
#[derive(Clone)]
pub struct FormHandle {
    controller: FormController,
    id: FormId,
}

impl FormHandle {
    pub(super) fn new(controller: FormController, id: FormId) -> Self {
        Self { controller, id }
    }

    pub fn id(&self) -> &FormId {
        &self.id
    }

    pub fn controller(&self) -> &FormController {
        &self.controller
    }

    pub fn register_field(
        &self,
        name: impl Into<FieldKey>,
        default_value: impl Into<FieldValue>,
    ) -> FormResult<FieldBinding> {
        self.register_field_with(FieldOptions::new(name, default_value))
    }

    pub fn register_field_with(&self, options: FieldOptions) -> FormResult<FieldBinding> {
        let name = options.name.clone();
        self.controller.register_field_with(&self.id, options)?;
        Ok(self.field(name))
    }

    pub fn register_model<T>(&self, model: &T) -> FormResult<Vec<FieldBinding>>
    where
        T: FormValues,
    {
        model
            .to_values()
            .into_iter()
            .map(|(name, value)| self.register_field(name, value))
            .collect()
    }

    pub fn deregister_field(&self, name: impl Into<FieldKey>) -> FormResult<()> {
        self.controller.deregister_field(&self.id, name)
    }

    pub fn field(&self, name: impl Into<FieldKey>) -> FieldBinding {
        FieldBinding {
            controller: self.controller.clone(),
            form_id: self.id.clone(),
            name: name.into(),
        }
    }

    pub fn on_change(
        &self,
        name: impl Into<FieldKey>,
        value: impl Into<FieldValue>,
    ) -> FormResult<()> {
        self.controller.on_change(&self.id, name, value)
    }

    pub fn on_blur(&self, name: impl Into<FieldKey>) -> FormResult<()> {
        self.controller.on_blur(&self.id, name)
    }

    pub fn set_values(&self, values: ValueMap, revalidate: bool) -> FormResult<()> {
        self.controller.set_values(&self.id, values, revalidate)
    }

    pub fn set_model<T>(&self, model: &T, revalidate: bool) -> FormResult<()>
    where
        T: FormValues,
    {
        self.set_values(model.to_values(), revalidate)
    }

    pub fn set_errors(&self, errors: BTreeMap<FieldKey, Option<FieldError>>) -> FormResult<()> {
        self.controller.set_errors(&self.id, errors)
    }

    pub fn set_touched(&self, touched: BTreeMap<FieldKey, bool>) -> FormResult<()> {
        self.controller.set_touched_fields(&self.id, touched)
    }

    pub fn reset(&self) -> FormResult<()> {
        self.controller.reset(&self.id)
    }

    pub fn set_submit_handler(&self, handler: impl SubmitHandler) -> FormResult<()> {
        self.controller.set_submit_handler(&self.id, handler)
    }

    pub fn submit(&self) -> FormResult<SubmissionHandle> {
        self.controller.submit(&self.id)
    }

    pub fn handle_submit(&self) -> FormResult<SubmissionHandle> {
        self.controller.handle_submit(&self.id)
    }

    pub fn is_submitting(&self) -> FormResult<bool> {
        self.controller.is_submitting(&self.id)
    }

    pub async fn validate(&self) -> FormResult<Vec<(FieldKey, Option<FieldError>)>> {
        self.controller.validate_form(&self.id).await
    }

    pub fn snapshot(&self) -> FormResult<FormSnapshot> {
        self.controller.snapshot(&self.id)
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&FormEvent) + Send + Sync + 'static,
    ) -> FormResult<SubscriptionId> {
        self.controller.subscribe(&self.id, listener)
    }

    pub fn unmount(&self) -> FormResult<()> {
        self.controller.unmount_form(&self.id)
    }
}

/// One field of one form, the handle a rendered input holds on to.
#[derive(Clone)]
pub struct FieldBinding {
    controller: FormController,
    form_id: FormId,
    name: FieldKey,
}

impl FieldBinding {
    pub fn form_id(&self) -> &FormId {
        &self.form_id
    }

    pub fn name(&self) -> &FieldKey {
        &self.name
    }

    /// Field identity is fixed for the lifetime of a registration; a binding
    /// asked to serve another name or form reports it instead of following.
    pub fn check_identity(&self, form_id: &FormId, name: &str) -> FormResult<()> {
        if form_id != &self.form_id {
            let error = FormError::FormChanged {
                name: self.name.clone(),
                registered: self.form_id.clone(),
                requested: form_id.clone(),
            };
            tracing::warn!(%error, "field binding identity violated");
            return Err(error);
        }
        if name != self.name.as_str() {
            let error = FormError::FieldRenamed {
                form: self.form_id.clone(),
                registered: self.name.clone(),
                requested: FieldKey::from(name),
            };
            tracing::warn!(%error, "field binding identity violated");
            return Err(error);
        }
        Ok(())
    }

    pub fn on_change(&self, value: impl Into<FieldValue>) -> FormResult<()> {
        self.controller.on_change(&self.form_id, &self.name, value)
    }

    pub fn on_blur(&self) -> FormResult<()> {
        self.controller.on_blur(&self.form_id, &self.name)
    }

    pub fn set_validator(&self, validator: impl FieldValidator) -> FormResult<()> {
        self.controller
            .set_validator(&self.form_id, &self.name, validator)
    }

    pub fn validate(&self) -> FormResult<ValidationHandle> {
        self.controller.validate_field(&self.form_id, &self.name)
    }

    pub fn pending_validation(&self) -> FormResult<Option<ValidationHandle>> {
        self.controller
            .pending_validation(&self.form_id, self.name.as_str())
    }

    pub fn meta(&self) -> FormResult<Option<FieldMeta>> {
        self.controller.field_meta(&self.form_id, self.name.as_str())
    }

    pub fn deregister(&self) -> FormResult<()> {
        self.controller.deregister_field(&self.form_id, &self.name)
    }
}
