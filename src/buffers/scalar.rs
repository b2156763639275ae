//! Scalars: a single typed value.

use crate::core::context::Context;
use crate::core::error::{VxError, VxResult};
use crate::core::reference::{Handle, NewReference, Object, Scalar};
use crate::core::types::DataType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::mem::discriminant;

/// Value held by a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ScalarValue {
    U8(u8),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    Size(usize),
}

impl ScalarValue {
    /// Data type of the value.
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::U8(_) => DataType::UInt8,
            ScalarValue::I16(_) => DataType::Int16,
            ScalarValue::U32(_) => DataType::UInt32,
            ScalarValue::I32(_) => DataType::Int32,
            ScalarValue::F32(_) => DataType::Float32,
            ScalarValue::Bool(_) => DataType::Bool,
            ScalarValue::Size(_) => DataType::Size,
        }
    }

    /// Unsigned integer content, if the value has one that fits.
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            ScalarValue::U8(v) => Some(v as u32),
            ScalarValue::U32(v) => Some(v),
            ScalarValue::Size(v) => u32::try_from(v).ok(),
            _ => None,
        }
    }

    /// Float content.
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            ScalarValue::F32(v) => Some(v),
            _ => None,
        }
    }
}

pub(crate) struct ScalarObject {
    value: Mutex<ScalarValue>,
}

impl ScalarObject {
    pub(crate) fn get(&self) -> ScalarValue {
        *self.value.lock()
    }
}

impl Context {
    /// Create a scalar holding `value`.
    pub fn create_scalar(&self, value: ScalarValue) -> VxResult<Scalar> {
        let object = ScalarObject {
            value: Mutex::new(value),
        };
        let reference = self.create_reference(NewReference::external(Object::Scalar(object)))?;
        Ok(Scalar::wrap(reference))
    }

    /// Current value of a scalar.
    pub fn read_scalar(&self, scalar: Scalar) -> VxResult<ScalarValue> {
        let entry = self.entry(scalar.reference())?;
        self.check_accessible(scalar.reference(), &entry)?;
        let value = entry.scalar()?.get();
        entry.header.record_access(true, false);
        Ok(value)
    }

    /// Replace the value of a scalar. The new value must have the same type.
    pub fn write_scalar(&self, scalar: Scalar, value: ScalarValue) -> VxResult<()> {
        let entry = self.entry(scalar.reference())?;
        self.check_accessible(scalar.reference(), &entry)?;
        let mut current = entry.scalar()?.value.lock();
        if discriminant(&*current) != discriminant(&value) {
            return Err(VxError::invalid_type(current.data_type(), value.data_type()));
        }
        *current = value;
        entry.header.record_access(false, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Status;

    #[test]
    fn test_read_write() {
        let ctx = Context::new();
        let scalar = ctx.create_scalar(ScalarValue::U32(3)).unwrap();
        assert_eq!(ctx.read_scalar(scalar).unwrap(), ScalarValue::U32(3));

        ctx.write_scalar(scalar, ScalarValue::U32(9)).unwrap();
        assert_eq!(ctx.read_scalar(scalar).unwrap().as_u32(), Some(9));

        let err = ctx.write_scalar(scalar, ScalarValue::F32(1.0)).unwrap_err();
        assert_eq!(err.status(), Status::InvalidType);
        assert_eq!(ctx.query_reference(scalar).unwrap().write_count, 1);
    }
}
