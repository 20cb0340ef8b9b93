//! Bytecode disassembler, driven by the `-s` CLI flag (spec.md §6). Out of
//! scope for the compiler's own correctness per spec.md §1 ("only their
//! interfaces specified"), but implemented here since the CLI needs a
//! concrete one to dump bytecode before execution. Mnemonics and format
//! are grounded on `original_source/clox/disassemble.c`.

use lumen_core::chunk::{Chunk, OpCode};
use lumen_core::value::Value;

/// Disassemble every instruction in `chunk`, prefixed with a `=== name ===`
/// banner, one instruction per line.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = format!("=== {name} ===\n");
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
        out.push('\n');
    }
    out
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    u16::from(chunk.code[offset]) | (u16::from(chunk.code[offset + 1]) << 8)
}

fn simple(name: &str, offset: usize, out: &mut String) -> usize {
    out.push_str(name);
    offset + 1
}

fn constant(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let index = chunk.code[offset + 1] as usize;
    out.push_str(&format!("{name} {index:03} '{}'", chunk.constants[index]));
    offset + 2
}

fn constant_long(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let index = read_u16(chunk, offset + 1) as usize;
    out.push_str(&format!("{name} {index:05} '{}'", chunk.constants[index]));
    offset + 3
}

fn byte(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    out.push_str(&format!("{name} {slot:03}"));
    offset + 2
}

fn byte2(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let slot = read_u16(chunk, offset + 1);
    out.push_str(&format!("{name} {slot:05}"));
    offset + 3
}

fn jump(name: &str, sign: i64, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let distance = read_u16(chunk, offset + 1) as i64;
    let target = offset as i64 + 3 + sign * distance;
    out.push_str(&format!("{name} {offset} -> {target}"));
    offset + 3
}

fn invoke(name: &str, long_form: bool, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let (index, next) = if long_form {
        (read_u16(chunk, offset + 1) as usize, offset + 4)
    } else {
        (chunk.code[offset + 1] as usize, offset + 3)
    };
    let argc = chunk.code[next - 1];
    out.push_str(&format!(
        "{name} ({argc:03} args) {index:05} '{}'",
        chunk.constants[index]
    ));
    next
}

fn closure(long_form: bool, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let mut o = offset + 1;
    let index = if long_form {
        let i = read_u16(chunk, o) as usize;
        o += 2;
        i
    } else {
        let i = chunk.code[o] as usize;
        o += 1;
        i
    };
    out.push_str(&format!("clo {index:03} '{}'", chunk.constants[index]));

    let upvalue_count = match &chunk.constants[index] {
        Value::Obj(obj) => match obj.kind() {
            lumen_core::object::ObjKind::Function(f) => f.upvalue_count,
            _ => 0,
        },
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[o] != 0;
        o += 1;
        let idx = read_u16(chunk, o);
        o += 2;
        out.push_str(&format!(
            "\n{:04}:       | {} {:05}",
            o - 3,
            if is_local { "local" } else { "upvalue" },
            idx
        ));
    }
    o
}

/// Disassemble a single instruction at `offset`, returning the offset of
/// the next instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    out.push_str(&format!("{offset:04}: "));
    let line = chunk.get_line(offset);
    if offset != 0 && line == chunk.get_line(offset - 1) {
        out.push_str("   | ");
    } else {
        out.push_str(&format!("{line:04} "));
    }

    let op = OpCode::from_u8(chunk.code[offset]);
    match op {
        OpCode::Constant => constant("ldc", chunk, offset, out),
        OpCode::ConstantLong => constant_long("ldc", chunk, offset, out),
        OpCode::Nil => simple("ldn", offset, out),
        OpCode::True => simple("ldt", offset, out),
        OpCode::False => simple("ldf", offset, out),
        OpCode::Pop => simple("pop", offset, out),
        OpCode::DefineGlobal => constant("dfg", chunk, offset, out),
        OpCode::DefineGlobalLong => constant_long("dfg", chunk, offset, out),
        OpCode::GetGlobal => constant("ldg", chunk, offset, out),
        OpCode::GetGlobalLong => constant_long("ldg", chunk, offset, out),
        OpCode::SetGlobal => constant("stg", chunk, offset, out),
        OpCode::SetGlobalLong => constant_long("stg", chunk, offset, out),
        OpCode::GetLocal => byte("ldl", chunk, offset, out),
        OpCode::GetLocalLong => byte2("ldl", chunk, offset, out),
        OpCode::SetLocal => byte("stl", chunk, offset, out),
        OpCode::SetLocalLong => byte2("stl", chunk, offset, out),
        OpCode::GetUpvalue => byte("ldu", chunk, offset, out),
        OpCode::SetUpvalue => byte("stu", chunk, offset, out),
        OpCode::GetProperty => constant("ldp", chunk, offset, out),
        OpCode::GetPropertyLong => constant_long("ldp", chunk, offset, out),
        OpCode::SetProperty => constant("stp", chunk, offset, out),
        OpCode::SetPropertyLong => constant_long("stp", chunk, offset, out),
        OpCode::GetSuper => constant("lds", chunk, offset, out),
        OpCode::GetSuperLong => constant_long("lds", chunk, offset, out),
        OpCode::Eq => simple("cme", offset, out),
        OpCode::Greater => simple("cmg", offset, out),
        OpCode::Less => simple("cml", offset, out),
        OpCode::Add => simple("add", offset, out),
        OpCode::Sub => simple("sub", offset, out),
        OpCode::Mul => simple("mul", offset, out),
        OpCode::Div => simple("div", offset, out),
        OpCode::Not => simple("not", offset, out),
        OpCode::Negate => simple("neg", offset, out),
        OpCode::Print => simple("prt", offset, out),
        OpCode::Branch => jump("bfw", 1, chunk, offset, out),
        OpCode::BranchFalse => jump("bfl", 1, chunk, offset, out),
        OpCode::BranchBack => jump("bbw", -1, chunk, offset, out),
        OpCode::Call => byte("cal", chunk, offset, out),
        OpCode::Invoke => invoke("ivk", false, chunk, offset, out),
        OpCode::InvokeLong => invoke("ivk", true, chunk, offset, out),
        OpCode::SuperInvoke => invoke("svk", false, chunk, offset, out),
        OpCode::SuperInvokeLong => invoke("svk", true, chunk, offset, out),
        OpCode::Return => simple("ret", offset, out),
        OpCode::Closure => closure(false, chunk, offset, out),
        OpCode::ClosureLong => closure(true, chunk, offset, out),
        OpCode::CloseUpvalue => simple("clu", offset, out),
        OpCode::Class => constant("dfc", chunk, offset, out),
        OpCode::ClassLong => constant_long("dfc", chunk, offset, out),
        OpCode::Method => constant("dfm", chunk, offset, out),
        OpCode::MethodLong => constant_long("dfm", chunk, offset, out),
        OpCode::Static => constant("dfs", chunk, offset, out),
        OpCode::StaticLong => constant_long("dfs", chunk, offset, out),
        OpCode::Inherit => simple("inh", offset, out),
        OpCode::BuildArray => byte("bar", chunk, offset, out),
        OpCode::GetIndex => simple("ldi", offset, out),
        OpCode::SetIndex => simple("sti", offset, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::Heap;

    #[test]
    fn disassembles_a_constant_and_a_return() {
        let mut heap = Heap::new();
        let _ = &mut heap;
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.0));
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_byte(idx as u8, 1);
        chunk.write_op(OpCode::Return, 1);

        let text = disassemble_chunk(&chunk, "test");
        assert!(text.contains("=== test ==="));
        assert!(text.contains("ldc 000 '1'"));
        assert!(text.contains("ret"));
    }
}
