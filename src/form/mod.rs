mod controller;
mod guard;
mod handle;
mod nested;
mod store;
mod submission;
mod validation;
mod value;

#[cfg(test)]
mod tests;

pub use calmform_derive::FormValues;
pub use controller::{
    FieldId, FieldKey, FieldMeta, FieldOptions, FormController, FormError, FormEvent,
    FormEventKind, FormId, FormOptions, FormResult, FormSnapshot, SubscriptionId,
    ValidationTriggers,
};
pub use guard::{EffectGuard, GuardScope, StaleEffect};
pub use handle::{FieldBinding, FormHandle};
pub use nested::{
    ComposedField, RefreshPolicy, SchemaEntry, SchemaFetchError, SchemaFuture, SchemaOutcome,
    SchemaProvider,
};
pub use submission::{
    SubmissionHandle, SubmissionTicket, SubmitFuture, SubmitHandler, SubmitPayload,
};
pub use validation::{
    BoxedValidationFuture, FieldBag, FieldValidator, ValidationHandle, ValidationOutcome,
    ValidationTrigger,
};
pub use value::{
    FETCH_FAILED_MESSAGE, FieldError, FieldValue, FormValues, FromFieldValue, NOT_READY_MESSAGE,
    REQUIRED_MESSAGE, ValueMap, decode_field,
};
