use alloc::{boxed::Box, format, string::ToString, vec::Vec};
use zerowasm_types::*;

use crate::{ParseError, Result};

pub(crate) fn convert_valtype(valtype: &wasmparser::ValType) -> Result<ValType> {
    use wasmparser::ValType::*;
    Ok(match valtype {
        I32 => ValType::I32,
        I64 => ValType::I64,
        F32 => ValType::F32,
        F64 => ValType::F64,
        V128 => ValType::V128,
        Ref(r) => convert_reftype(r)?,
    })
}

pub(crate) fn convert_reftype(reftype: &wasmparser::RefType) -> Result<ValType> {
    if reftype.is_func_ref() {
        Ok(ValType::FuncRef)
    } else if reftype.is_extern_ref() {
        Ok(ValType::ExternRef)
    } else {
        Err(ParseError::UnsupportedOperator(format!("reference type {reftype:?}")))
    }
}

pub(crate) fn convert_heaptype(heap: &wasmparser::HeapType) -> Result<ValType> {
    match heap {
        wasmparser::HeapType::Abstract { ty: wasmparser::AbstractHeapType::Func, .. } => Ok(ValType::FuncRef),
        wasmparser::HeapType::Abstract { ty: wasmparser::AbstractHeapType::Extern, .. } => Ok(ValType::ExternRef),
        other => Err(ParseError::UnsupportedOperator(format!("heap type {other:?}"))),
    }
}

pub(crate) fn convert_func_type(group: wasmparser::RecGroup) -> Result<FuncType> {
    let mut types = group.types();
    if types.len() != 1 {
        return Err(ParseError::UnsupportedOperator("recursive type groups".to_string()));
    }
    let sub = types.next().expect("checked length above");
    if !matches!(sub.composite_type.inner, wasmparser::CompositeInnerType::Func(_)) {
        return Err(ParseError::UnsupportedOperator("non-function types".to_string()));
    }
    let func = sub.unwrap_func();

    let params = func.params().iter().map(convert_valtype).collect::<Result<Vec<_>>>()?.into_boxed_slice();
    let results = func.results().iter().map(convert_valtype).collect::<Result<Vec<_>>>()?.into_boxed_slice();
    Ok(FuncType { params, results })
}

pub(crate) fn convert_table_type(ty: &wasmparser::TableType) -> Result<TableType> {
    let min = ty
        .initial
        .try_into()
        .map_err(|_| ParseError::TooLarge(format!("table size {}", ty.initial)))?;
    let max = match ty.maximum {
        Some(max) => Some(max.try_into().map_err(|_| ParseError::TooLarge(format!("table size {max}")))?),
        None => None,
    };
    Ok(TableType { element: convert_reftype(&ty.element_type)?, min, max })
}

pub(crate) fn convert_global_type(ty: &wasmparser::GlobalType) -> Result<GlobalType> {
    Ok(GlobalType { ty: convert_valtype(&ty.content_type)?, mutable: ty.mutable })
}

/// Applies the embedder's memory sizer to a decoded memory type and checks
/// the resulting limits.
pub(crate) fn convert_memory_type(
    memory: &wasmparser::MemoryType,
    sizer: &dyn Fn(u32, Option<u32>) -> (u32, u32, u32),
) -> Result<MemoryType> {
    if memory.memory64 {
        return Err(ParseError::UnsupportedOperator("64-bit memories".to_string()));
    }
    let min: u32 = memory
        .initial
        .try_into()
        .map_err(|_| ParseError::TooLarge(format!("memory min {} pages", memory.initial)))?;
    let decoded_max: Option<u32> = match memory.maximum {
        Some(max) => Some(max.try_into().map_err(|_| ParseError::TooLarge(format!("memory max {max} pages")))?),
        None => None,
    };

    let (min, cap, max) = sizer(min, decoded_max);
    if min > cap || cap > max || max > MAX_PAGES {
        return Err(ParseError::Other(format!(
            "invalid memory limits: min={min} cap={cap} max={max} (max {MAX_PAGES} pages)"
        )));
    }
    Ok(MemoryType { min, cap, max })
}

/// Decodes a constant expression: a single typed `const`, `global.get`,
/// `ref.null`, or `ref.func`, followed by `end`.
pub(crate) fn convert_const_expr(expr: &wasmparser::ConstExpr<'_>) -> Result<ConstExpr> {
    let mut ops = expr.get_operators_reader();
    let op = ops.read()?;
    let result = match op {
        wasmparser::Operator::I32Const { value } => ConstExpr::I32(value),
        wasmparser::Operator::I64Const { value } => ConstExpr::I64(value),
        wasmparser::Operator::F32Const { value } => ConstExpr::F32(f32::from_bits(value.bits())),
        wasmparser::Operator::F64Const { value } => ConstExpr::F64(f64::from_bits(value.bits())),
        wasmparser::Operator::V128Const { value } => ConstExpr::V128(value.i128() as u128),
        wasmparser::Operator::GlobalGet { global_index } => ConstExpr::GlobalGet(global_index),
        wasmparser::Operator::RefNull { hty } => ConstExpr::RefNull(convert_heaptype(&hty)?),
        wasmparser::Operator::RefFunc { function_index } => ConstExpr::RefFunc(function_index),
        other => return Err(ParseError::UnsupportedOperator(format!("constant instruction {other:?}"))),
    };
    match ops.read()? {
        wasmparser::Operator::End => Ok(result),
        other => Err(ParseError::UnsupportedOperator(format!("constant instruction {other:?}"))),
    }
}

pub(crate) fn convert_element(element: wasmparser::Element<'_>) -> Result<Element> {
    let kind = match element.kind {
        wasmparser::ElementKind::Active { table_index, offset_expr } => ElementKind::Active {
            table: table_index.unwrap_or(0),
            offset: convert_const_expr(&offset_expr)?,
        },
        wasmparser::ElementKind::Passive => ElementKind::Passive,
        wasmparser::ElementKind::Declared => ElementKind::Declared,
    };

    match element.items {
        wasmparser::ElementItems::Functions(funcs) => {
            let items = funcs
                .into_iter()
                .map(|func| Ok(ConstExpr::RefFunc(func?)))
                .collect::<Result<Vec<_>>>()?
                .into_boxed_slice();
            Ok(Element { kind, items, ty: ValType::FuncRef })
        }
        wasmparser::ElementItems::Expressions(ty, exprs) => {
            let items = exprs
                .into_iter()
                .map(|expr| convert_const_expr(&expr?))
                .collect::<Result<Vec<_>>>()?
                .into_boxed_slice();
            Ok(Element { kind, items, ty: convert_reftype(&ty)? })
        }
    }
}

pub(crate) fn convert_data(data: wasmparser::Data<'_>) -> Result<Data> {
    Ok(Data {
        data: Box::from(data.data),
        kind: match data.kind {
            wasmparser::DataKind::Active { memory_index, offset_expr } => {
                DataKind::Active { memory: memory_index, offset: convert_const_expr(&offset_expr)? }
            }
            wasmparser::DataKind::Passive => DataKind::Passive,
        },
    })
}

pub(crate) fn convert_export(export: wasmparser::Export<'_>) -> Result<Export> {
    let kind = match export.kind {
        wasmparser::ExternalKind::Func => ExternalKind::Func,
        wasmparser::ExternalKind::Table => ExternalKind::Table,
        wasmparser::ExternalKind::Memory => ExternalKind::Memory,
        wasmparser::ExternalKind::Global => ExternalKind::Global,
        other => return Err(ParseError::UnsupportedOperator(format!("export kind {other:?}"))),
    };
    Ok(Export { name: Box::from(export.name), kind, index: export.index })
}
