use calmform::form::{FieldKey, FieldValue, FormValues};

#[derive(Clone, calmform::form::FormValues)]
struct DemoForm {
    email: String,
    subscribed: bool,
}

fn main() {
    let model = DemoForm {
        email: "a@calm.form".to_string(),
        subscribed: true,
    };
    let values = model.to_values();
    assert_eq!(DemoForm::field_names(), &["email", "subscribed"]);
    assert_eq!(
        values.get(&FieldKey::from("email")),
        Some(&FieldValue::from("a@calm.form"))
    );

    let decoded = DemoForm::from_values(&values).expect("values decode");
    assert_eq!(decoded.email, "a@calm.form");
    assert!(decoded.subscribed);
}
