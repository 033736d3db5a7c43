//! Built-in kernels shipped with the host backend.
//!
//! | name            | arguments                                   |
//! |-----------------|---------------------------------------------|
//! | `fill_u32`      | `0: buffer out`, `1: u32 value`             |
//! | `add_u32`       | `0: buffer a`, `1: buffer b`, `2: buffer out` |
//! | `scale_f32`     | `0: buffer data`, `1: f32 factor`           |
//! | `group_sum_u32` | `0: buffer in`, `1: local u32 x group`, `2: buffer out` |
//! | `trap`          | none; always fails                          |

use std::sync::Arc;

use anvil_core::{HalError, HalResult};

use crate::kernel::{KernelArgs, KernelBody, KernelLibrary, KernelProperties, WorkItem};

pub(crate) fn register(library: &mut KernelLibrary) {
    library.register_builtin("fill_u32", Arc::new(FillU32), KernelProperties::default());
    library.register_builtin("add_u32", Arc::new(AddU32), KernelProperties::default());
    library.register_builtin("scale_f32", Arc::new(ScaleF32), KernelProperties::default());
    library.register_builtin("group_sum_u32", Arc::new(GroupSumU32), KernelProperties::default());
    library.register_builtin("trap", Arc::new(Trap), KernelProperties::default());
}

#[derive(Debug)]
struct FillU32;

impl KernelBody for FillU32 {
    fn execute(&self, item: &WorkItem, args: &KernelArgs) -> HalResult<()> {
        let value: u32 = args.plain(1)?;
        args.buffer(0)?.write(item.linear_global_id(), value)
    }
}

#[derive(Debug)]
struct AddU32;

impl KernelBody for AddU32 {
    fn execute(&self, item: &WorkItem, args: &KernelArgs) -> HalResult<()> {
        let index = item.linear_global_id();
        let a: u32 = args.buffer(0)?.read(index)?;
        let b: u32 = args.buffer(1)?.read(index)?;
        args.buffer(2)?.write(index, a.wrapping_add(b))
    }
}

#[derive(Debug)]
struct ScaleF32;

impl KernelBody for ScaleF32 {
    fn execute(&self, item: &WorkItem, args: &KernelArgs) -> HalResult<()> {
        let factor: f32 = args.plain(1)?;
        let data = args.buffer(0)?;
        let index = item.linear_global_id();
        let value: f32 = data.read(index)?;
        data.write(index, value * factor)
    }
}

/// Each item stores its input in local memory; the last item of the group
/// reduces the block.
#[derive(Debug)]
struct GroupSumU32;

impl KernelBody for GroupSumU32 {
    fn execute(&self, item: &WorkItem, args: &KernelArgs) -> HalResult<()> {
        let local = args.local(1)?;
        let value: u32 = args.buffer(0)?.read(item.linear_global_id())?;
        local.write(item.linear_local_id(), value)?;

        let group_items: usize = item.local_size.iter().product();
        if item.linear_local_id() + 1 == group_items {
            let mut sum = 0u32;
            for index in 0..group_items {
                sum = sum.wrapping_add(local.read(index)?);
            }
            args.buffer(2)?.write(item.linear_group_id(), sum)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Trap;

impl KernelBody for Trap {
    fn execute(&self, item: &WorkItem, _args: &KernelArgs) -> HalResult<()> {
        Err(HalError::Failure(format!(
            "trap at work item {:?}",
            item.global_id
        )))
    }
}
