use opentelemetry_proto::tonic::common::v1::any_value::Value as AnyValueInner;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};
use opentelemetry_proto::tonic::trace::v1::span::SpanKind;
use serde_json::Value;

use crate::proto::Span;

/// A builder for constructing assertions over recorded spans.
#[derive(Debug)]
pub struct SpanAssertion<'a> {
    spans: &'a [Span],
    name: Option<String>,
    kind: Option<SpanKind>,
    trace_id: Option<Vec<u8>>,
    attributes: Option<Vec<(String, Value)>>,
    event_names: Option<Vec<String>>,
}

impl<'a> SpanAssertion<'a> {
    pub(crate) fn new(spans: &'a [Span], name: Option<String>) -> Self {
        Self {
            spans,
            name,
            kind: None,
            trace_id: None,
            attributes: None,
            event_names: None,
        }
    }

    /// Adds attribute criteria.
    ///
    /// All attributes must have the same value type. For mixed types, use
    /// [`with_attribute`](Self::with_attribute) instead.
    #[must_use]
    pub fn with_attributes<I, K, V>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.attributes = Some(
            attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    #[must_use]
    pub fn with_attribute<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.attributes
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<Vec<u8>>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Requires the span to carry an event with this exact name.
    ///
    /// Can be called multiple times; every named event must be present.
    #[must_use]
    pub fn with_event<S: Into<String>>(mut self, event_name: S) -> Self {
        self.event_names
            .get_or_insert_with(Vec::new)
            .push(event_name.into());
        self
    }

    /// Asserts that at least one span matches all specified criteria.
    ///
    /// # Panics
    ///
    /// Panics with a descriptive message if no match is found.
    #[allow(clippy::panic)]
    #[track_caller]
    pub fn assert_exists(&self) {
        if !self.matches_any() {
            panic!("{}", self.build_error_message());
        }
    }

    /// Asserts that no spans match the specified criteria.
    ///
    /// # Panics
    ///
    /// Panics if any span matches.
    #[allow(clippy::panic)]
    #[track_caller]
    pub fn assert_not_exists(&self) {
        if self.matches_any() {
            panic!(
                "Expected no spans to match, but found {} matching.\nCriteria: {}",
                self.count(),
                self.format_criteria()
            );
        }
    }

    #[allow(clippy::panic)]
    #[track_caller]
    pub fn assert_count(&self, expected: usize) {
        let actual = self.count();
        if actual != expected {
            panic!(
                "Expected {} matching spans, but found {}.\nCriteria: {}\n\n{}",
                expected,
                actual,
                self.format_criteria(),
                self.format_matching_spans()
            );
        }
    }

    #[allow(clippy::panic)]
    #[track_caller]
    pub fn assert_at_least(&self, min: usize) {
        let actual = self.count();
        if actual < min {
            panic!(
                "Expected at least {} matching spans, but found {}.\nCriteria: {}",
                min,
                actual,
                self.format_criteria()
            );
        }
    }

    #[allow(clippy::panic)]
    #[track_caller]
    pub fn assert_at_most(&self, max: usize) {
        let actual = self.count();
        if actual > max {
            panic!(
                "Expected at most {} matching spans, but found {}.\nCriteria: {}",
                max,
                actual,
                self.format_criteria()
            );
        }
    }

    #[must_use = "the count should be used"]
    pub fn count(&self) -> usize {
        self.spans.iter().filter(|span| self.matches(span)).count()
    }

    #[must_use = "the matching spans should be used"]
    pub fn get_all(&self) -> Vec<&'a Span> {
        self.spans.iter().filter(|span| self.matches(span)).collect()
    }

    fn matches_any(&self) -> bool {
        self.spans.iter().any(|span| self.matches(span))
    }

    fn matches(&self, span: &Span) -> bool {
        if let Some(ref expected_name) = self.name
            && &span.name != expected_name
        {
            return false;
        }

        if let Some(kind) = self.kind
            && span.kind != kind as i32
        {
            return false;
        }

        if let Some(ref trace_id) = self.trace_id
            && &span.trace_id != trace_id
        {
            return false;
        }

        if let Some(ref expected_attrs) = self.attributes
            && !check_attributes(&span.attributes, expected_attrs)
        {
            return false;
        }

        if let Some(ref expected_events) = self.event_names {
            return expected_events
                .iter()
                .all(|name| span.events.iter().any(|event| &event.name == name));
        }

        true
    }

    fn format_criteria(&self) -> String {
        let mut criteria = Vec::new();
        if let Some(name) = &self.name {
            criteria.push(format!("name={:?}", name));
        }
        if let Some(kind) = self.kind {
            criteria.push(format!("kind={}", kind.as_str_name()));
        }
        if let Some(trace_id) = &self.trace_id {
            criteria.push(format!("trace_id={}", hex(trace_id)));
        }
        if let Some(attrs) = &self.attributes {
            criteria.push(format!("attributes={:?}", attrs));
        }
        if let Some(events) = &self.event_names {
            criteria.push(format!("event_names={:?}", events));
        }
        criteria.join(", ")
    }

    fn format_matching_spans(&self) -> String {
        let matching = self.get_all();
        if matching.is_empty() {
            return String::new();
        }

        let mut output = String::from("Matching spans:\n");
        for (idx, span) in matching.iter().enumerate() {
            output.push_str(&format!("  [{}] name=\"{}\"\n", idx, span.name));
        }
        output
    }

    fn build_error_message(&self) -> String {
        let mut msg = String::from("No spans matched the assertion.\n\nExpected: ");
        msg.push_str(&self.format_criteria());
        msg.push_str(&format!(
            "\n\nFound {} span(s) in observer:\n",
            self.spans.len()
        ));

        for (idx, span) in self.spans.iter().take(10).enumerate() {
            msg.push_str(&format!("  [{}] name=\"{}\"", idx, span.name));
            if !span.attributes.is_empty() {
                msg.push_str(&format!(
                    ", attributes={}",
                    format_attributes(&span.attributes, 3)
                ));
            }
            msg.push('\n');
        }

        if self.spans.len() > 10 {
            msg.push_str(&format!("  ... and {} more\n", self.spans.len() - 10));
        }

        msg
    }
}

fn check_attributes(attrs: &[KeyValue], expected: &[(String, Value)]) -> bool {
    expected.iter().all(|(key, value)| {
        attrs
            .iter()
            .any(|kv| &kv.key == key && value_matches(kv.value.as_ref(), value))
    })
}

fn value_matches(actual: Option<&AnyValue>, expected: &Value) -> bool {
    match actual.and_then(|av| av.value.as_ref()) {
        Some(AnyValueInner::StringValue(s)) => expected.as_str() == Some(s.as_str()),
        Some(AnyValueInner::IntValue(i)) => expected.as_i64() == Some(*i),
        Some(AnyValueInner::DoubleValue(d)) => expected
            .as_f64()
            .is_some_and(|n| (*d - n).abs() < f64::EPSILON),
        Some(AnyValueInner::BoolValue(b)) => expected.as_bool() == Some(*b),
        _ => false,
    }
}

fn format_value(value: Option<&AnyValue>) -> String {
    match value.and_then(|av| av.value.as_ref()) {
        Some(AnyValueInner::StringValue(s)) => format!("{:?}", s),
        Some(AnyValueInner::IntValue(i)) => i.to_string(),
        Some(AnyValueInner::DoubleValue(d)) => format!("{:.6}", d),
        Some(AnyValueInner::BoolValue(b)) => b.to_string(),
        Some(AnyValueInner::ArrayValue(arr)) => format!("<array: {} item(s)>", arr.values.len()),
        Some(AnyValueInner::KvlistValue(kv)) => format!("<kvlist: {} item(s)>", kv.values.len()),
        Some(AnyValueInner::BytesValue(b)) => format!("<bytes: {} bytes>", b.len()),
        None => "<none>".to_string(),
    }
}

pub(crate) fn format_attributes(attrs: &[KeyValue], max_items: usize) -> String {
    let shown: Vec<String> = attrs
        .iter()
        .take(max_items)
        .map(|kv| format!("{}={}", kv.key, format_value(kv.value.as_ref())))
        .collect();
    let mut output = format!("{{{}", shown.join(", "));
    if attrs.len() > max_items {
        output.push_str(&format!(", ... +{}", attrs.len() - max_items));
    }
    output.push('}');
    output
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
