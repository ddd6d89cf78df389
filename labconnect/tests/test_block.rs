//! Test cases for converting blocks of values.

use rstest::*;

use labconnect::{
    BlockFormat, DataType,
    block::{BlockError, from_bytes, to_bytes},
};

fn dtype(code: &str) -> DataType {
    code.parse().unwrap()
}

#[rstest]
#[case(b"#14\x01\x00\x02\x00".as_slice(), "<i2", vec![1.0, 2.0])]
#[case(b"#14\x00\x01\x00\x02".as_slice(), ">i2", vec![1.0, 2.0])]
#[case(b"CURV #15\xff\x00\x01\x02\x03trailing".as_slice(), "u1", vec![255.0, 0.0, 1.0, 2.0, 3.0])]
#[case(b"#0\x05\x06\n".as_slice(), "i1", vec![5.0, 6.0])]
fn ieee_blocks(#[case] buffer: &[u8], #[case] code: &str, #[case] expected: Vec<f64>) {
    assert_eq!(
        from_bytes(buffer, BlockFormat::Ieee, dtype(code)).unwrap(),
        expected
    );
}

#[rstest]
fn hp_block_uses_byte_order() {
    let buffer = b"#A\x00\x04\x3f\x80\x00\x00";
    assert_eq!(
        from_bytes(buffer, BlockFormat::Hp, dtype(">f4")).unwrap(),
        vec![1.0]
    );
}

#[rstest]
#[case(" 1, 2.5 ,-3e2 ", vec![1.0, 2.5, -300.0])]
#[case("42", vec![42.0])]
#[case("", vec![])]
fn ascii_values(#[case] text: &str, #[case] expected: Vec<f64>) {
    assert_eq!(
        from_bytes(text.as_bytes(), BlockFormat::Ascii, DataType::default()).unwrap(),
        expected
    );
}

#[rstest]
#[case(b"no header".as_slice(), BlockFormat::Ieee)]
#[case(b"#x123".as_slice(), BlockFormat::Ieee)]
#[case(b"#2ab".as_slice(), BlockFormat::Ieee)]
#[case(b"#A\x01".as_slice(), BlockFormat::Hp)]
fn malformed_headers(#[case] buffer: &[u8], #[case] format: BlockFormat) {
    assert!(matches!(
        from_bytes(buffer, format, DataType::default()),
        Err(BlockError::Header { .. })
    ));
}

#[rstest]
fn truncated_block() {
    assert_eq!(
        from_bytes(b"#18\x00\x00", BlockFormat::Ieee, DataType::default()),
        Err(BlockError::Truncated {
            expected: 8,
            found: 2
        })
    );
}

#[rstest]
#[case(BlockFormat::None, b"\x00\x00\x80".as_slice())]
#[case(BlockFormat::Ieee, b"#13\x00\x00\x80".as_slice())]
fn partial_values(#[case] format: BlockFormat, #[case] buffer: &[u8]) {
    assert_eq!(
        from_bytes(buffer, format, DataType::default()),
        Err(BlockError::Length { len: 3, size: 4 })
    );
}

#[rstest]
fn ascii_block_is_comma_separated() {
    let block = to_bytes(&[1.0, -2.5, 3.0], BlockFormat::Ascii, dtype("<f8")).unwrap();
    assert_eq!(block, b"1,-2.5,3");
    let block = to_bytes(&[1.9, -2.0], BlockFormat::Ascii, dtype("i4")).unwrap();
    assert_eq!(block, b"1,-2");
}

#[rstest]
fn raw_values_without_header() {
    let block = to_bytes(&[258.0], BlockFormat::None, dtype(">u2")).unwrap();
    assert_eq!(block, vec![0x01, 0x02]);
}

#[rstest]
fn unparsable_ascii_value() {
    assert_eq!(
        from_bytes(b"1,two,3", BlockFormat::Ascii, DataType::default()),
        Err(BlockError::Parse("two".to_string()))
    );
}
