pub use crate::form::{
    ComposedField, FieldBinding, FieldError, FieldKey, FieldOptions, FieldValue, FormController,
    FormError, FormHandle, FormId, FormOptions, FormResult, FormSnapshot, FormValues,
    RefreshPolicy, SchemaEntry, SchemaFetchError, SubmitPayload, ValueMap,
};
