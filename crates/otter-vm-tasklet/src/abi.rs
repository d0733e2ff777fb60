//! Return value classification

use crate::error::{TaskletError, TaskletResult};
use crate::frame::TaskletReturnType;
use crate::walker::ReturnShape;

/// Decide how a resumed frame expects its return value.
///
/// Return buffers are delivered by reference (the integer register
/// carries the buffer address). Register-sized value types holding GC
/// pointers travel like object references. Floating point returns have no
/// register slot in the resume trampoline.
pub fn classify_return(shape: ReturnShape) -> TaskletResult<TaskletReturnType> {
    match shape {
        ReturnShape::ReturnBuffer => Ok(TaskletReturnType::ByReference),
        ReturnShape::ObjectReference | ReturnShape::ValueTypeWithPointers => {
            Ok(TaskletReturnType::ObjectReference)
        }
        ReturnShape::Primitive => Ok(TaskletReturnType::Integer),
        ReturnShape::FloatingPoint => Err(TaskletError::UnsupportedReturnType(
            "floating point and vector returns",
        )),
    }
}
