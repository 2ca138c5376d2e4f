use crate::codec::{CodecError, RowCodec, Value};
use crate::schema::{Column, ColumnType, IndexKind, IndexSpec, Schema};

fn schema() -> Schema {
    Schema::builder()
        .column(Column::new("id", ColumnType::U32, false))
        .column(Column::new("name", ColumnType::Str(32), false))
        .column(Column::new("nickname", ColumnType::Str(32), true))
        .column(Column::new(
            "balance",
            ColumnType::Decimal {
                precision: 8,
                scale: 2,
            },
            false,
        ))
        .column(Column::new("tag", ColumnType::Bytes(8), true))
        .index(IndexSpec::new("primary", IndexKind::Primary, vec!["id".into()]))
        .build()
        .unwrap()
}

#[test]
fn round_trips_a_row_with_nulls() {
    let codec = RowCodec::new(&schema());
    let row = vec![
        Value::U32(7),
        Value::Str("ada".into()),
        Value::Null,
        Value::Decimal(12345),
        Value::Null,
    ];
    let bytes = codec.encode(&row).expect("encode");
    let decoded = codec.decode(&bytes).expect("decode");
    assert_eq!(row, decoded);
}

#[test]
fn rejects_null_in_not_null_column() {
    let codec = RowCodec::new(&schema());
    let row = vec![
        Value::U32(1),
        Value::Null,
        Value::Null,
        Value::Decimal(0),
        Value::Null,
    ];
    assert!(matches!(codec.encode(&row), Err(CodecError::Constraint(_))));
}

#[test]
fn rejects_type_mismatch_without_widening() {
    let codec = RowCodec::new(&schema());
    let row = vec![
        Value::U64(1), // schema expects U32 — no implicit widening
        Value::Str("ada".into()),
        Value::Null,
        Value::Decimal(0),
        Value::Null,
    ];
    assert!(matches!(codec.encode(&row), Err(CodecError::TypeMismatch { .. })));
}

#[test]
fn rejects_string_exceeding_declared_length() {
    let codec = RowCodec::new(&schema());
    let row = vec![
        Value::U32(1),
        Value::Str("x".repeat(64)),
        Value::Null,
        Value::Decimal(0),
        Value::Null,
    ];
    assert!(matches!(
        codec.encode(&row),
        Err(CodecError::NumericOverflow(_))
    ));
}

#[test]
fn rejects_decimal_mantissa_beyond_precision() {
    let codec = RowCodec::new(&schema());
    let row = vec![
        Value::U32(1),
        Value::Str("ada".into()),
        Value::Null,
        Value::Decimal(1_000_000_00), // 8-digit precision exceeded
        Value::Null,
    ];
    assert!(matches!(
        codec.encode(&row),
        Err(CodecError::NumericOverflow(_))
    ));
}

#[test]
fn text_format_round_trips_with_escaping() {
    let codec = RowCodec::new(&schema());
    let row = vec![
        Value::U32(3),
        Value::Str("a|b\\c".into()),
        Value::Null,
        Value::Decimal(500),
        Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
    ];
    let text = codec.to_text(&row).expect("to_text");
    let parsed = codec.from_text(&text).expect("from_text");
    assert_eq!(row, parsed);
}

#[test]
fn wrong_field_count_in_binary_row_is_rejected() {
    let codec = RowCodec::new(&schema());
    let row = vec![Value::U32(1)];
    assert!(matches!(codec.encode(&row), Err(CodecError::Constraint(_))));
}
