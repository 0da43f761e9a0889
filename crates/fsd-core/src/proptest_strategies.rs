use crate::{DType, Literal, Shape, Value, parse_flag};
use proptest::prelude::*;

pub fn arb_literal() -> impl Strategy<Value = Literal> {
    prop_oneof![
        any::<i64>().prop_map(Literal::I64),
        any::<bool>().prop_map(Literal::Bool),
        prop::num::f64::NORMAL.prop_map(Literal::from_f64),
    ]
}

pub fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::scalar_i64),
        prop::num::f64::NORMAL.prop_map(Value::scalar_f64),
        any::<bool>().prop_map(Value::scalar_bool),
    ]
}

pub fn arb_shape() -> impl Strategy<Value = Shape> {
    prop_oneof![
        Just(Shape::scalar()),
        (1..=16u32).prop_map(Shape::vector),
        (1..=4u32, 1..=4u32).prop_map(|(rows, cols)| Shape::new(&[rows, cols])),
    ]
}

pub fn arb_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![
        Just(DType::F16),
        Just(DType::BF16),
        Just(DType::F32),
        Just(DType::F64),
        Just(DType::I8),
        Just(DType::I32),
        Just(DType::I64),
        Just(DType::U8),
        Just(DType::Bool),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn literal_value_eq_is_reflexive_for_non_nan(lit in arb_literal()) {
            prop_assert!(lit.value_eq(lit));
        }

        #[test]
        fn scalar_values_report_rank_zero(value in arb_value()) {
            prop_assert_eq!(value.rank(), Some(0));
            prop_assert!(value.dtype().is_some());
        }

        #[test]
        fn element_count_matches_dim_product(shape in arb_shape()) {
            let expected: u64 = shape.dims.iter().map(|d| u64::from(*d)).product();
            prop_assert_eq!(shape.element_count(), Some(expected));
        }

        #[test]
        fn exact_and_float_partition_dtypes(dtype in arb_dtype()) {
            prop_assert_ne!(dtype.is_exact(), dtype.is_float());
        }

        #[test]
        fn flag_parser_never_panics(raw in ".{0,12}") {
            let _ = parse_flag(&raw);
        }
    }
}
