// Hand-written line parser for the textual IR. The grammar is deliberately regular: one
// construct per line, blocks introduced by `label:` lines, values named `%x` and defined
// before use, types spelled out wherever an operand's interpretation depends on one.
// Floating-point literals accept either decimal (`2.5`) or exact bit-pattern (`0x40200000`)
// form; the printer always emits the bit-pattern form so that text round-trips are exact.
// Errors carry the 1-based source line.

use crate::ir::{
    AddrExpr, ArithOp, BlockId, CastOp, FpCond, Function, GlobalDecl, InstKind, IntCond, Module,
    Operand, Type, ValueId,
};
use hashbrown::HashMap;
use thiserror::Error;

/// Textual IR parse failure.
#[derive(Debug, Error)]
#[error("line {line}: {msg}")]
pub struct ParseError {
    pub line: usize,
    pub msg: String,
}

type Result<T> = std::result::Result<T, ParseError>;

fn err<T>(line: usize, msg: impl Into<String>) -> Result<T> {
    Err(ParseError {
        line,
        msg: msg.into(),
    })
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_type(line: usize, tok: &str) -> Result<Type> {
    match tok {
        "i1" => Ok(Type::I1),
        "i8" => Ok(Type::I8),
        "i16" => Ok(Type::I16),
        "i32" => Ok(Type::I32),
        "f32" => Ok(Type::F32),
        "f64" => Ok(Type::F64),
        other => err(line, format!("unknown type `{other}`")),
    }
}

fn sym_name<'a>(line: usize, tok: &'a str) -> Result<&'a str> {
    tok.strip_prefix('@')
        .ok_or(())
        .or_else(|_| err(line, format!("expected `@name`, found `{tok}`")))
}

/// Parse a whole module.
pub fn parse_module(src: &str) -> Result<Module> {
    let lines: Vec<(usize, &str)> = src
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, strip_comment(l).trim()))
        .collect();

    let mut module = Module::default();
    let mut i = 0;
    while i < lines.len() {
        let (ln, line) = lines[i];
        if line.is_empty() {
            i += 1;
            continue;
        }
        if line.starts_with("global ") {
            module.globals.push(parse_global(ln, line)?);
            i += 1;
        } else if line.starts_with("func ") {
            let mut j = i + 1;
            let mut body = Vec::new();
            while j < lines.len() && lines[j].1 != "}" {
                body.push(lines[j]);
                j += 1;
            }
            if j == lines.len() {
                return err(ln, "unterminated function body");
            }
            module.functions.push(parse_function(ln, line, &body)?);
            i = j + 1;
        } else {
            return err(ln, format!("unexpected `{line}`"));
        }
    }
    Ok(module)
}

/// `global @name ro|rw size N align N [init <hex>]`
fn parse_global(line: usize, text: &str) -> Result<GlobalDecl> {
    let toks: Vec<&str> = text.split_whitespace().collect();
    if toks.len() < 7 || toks[3] != "size" || toks[5] != "align" {
        return err(line, "expected `global @name ro|rw size N align N [init HEX]`");
    }
    let name = sym_name(line, toks[1])?.to_string();
    let read_only = match toks[2] {
        "ro" => true,
        "rw" => false,
        other => return err(line, format!("expected `ro` or `rw`, found `{other}`")),
    };
    let size: u32 = toks[4]
        .parse()
        .or_else(|_| err(line, "bad size"))?;
    let align: u32 = toks[6]
        .parse()
        .or_else(|_| err(line, "bad align"))?;
    let init = match toks.get(7) {
        Some(&"init") => {
            let hex = toks
                .get(8)
                .copied()
                .ok_or(())
                .or_else(|_| err(line, "missing init bytes"))?;
            if hex.len() % 2 != 0 {
                return err(line, "init bytes must be whole hex pairs");
            }
            let mut bytes = Vec::with_capacity(hex.len() / 2);
            for k in (0..hex.len()).step_by(2) {
                let b = u8::from_str_radix(&hex[k..k + 2], 16)
                    .or_else(|_| err(line, "bad init bytes"))?;
                bytes.push(b);
            }
            bytes
        }
        Some(other) => return err(line, format!("unexpected `{other}`")),
        None => Vec::new(),
    };
    if init.len() as u32 > size {
        return err(line, "initializer longer than size");
    }
    Ok(GlobalDecl {
        name,
        size,
        align,
        read_only,
        init,
    })
}

struct FuncParser<'a> {
    func: Function,
    values: HashMap<&'a str, ValueId>,
    blocks: HashMap<&'a str, BlockId>,
}

impl<'a> FuncParser<'a> {
    fn value(&self, line: usize, tok: &str) -> Result<ValueId> {
        let name = tok
            .strip_prefix('%')
            .ok_or(())
            .or_else(|_| err(line, format!("expected `%name`, found `{tok}`")))?;
        self.values
            .get(name)
            .copied()
            .ok_or(())
            .or_else(|_| err(line, format!("undefined value `%{name}`")))
    }

    fn define(&mut self, line: usize, tok: &'a str, ty: Type) -> Result<ValueId> {
        let name = tok
            .strip_prefix('%')
            .ok_or(())
            .or_else(|_| err(line, format!("expected `%name`, found `{tok}`")))?;
        if self.values.contains_key(name) {
            return err(line, format!("redefinition of `%{name}`"));
        }
        let v = self.func.new_value(ty);
        self.values.insert(name, v);
        Ok(v)
    }

    fn block(&self, line: usize, tok: &str) -> Result<BlockId> {
        self.blocks
            .get(tok)
            .copied()
            .ok_or(())
            .or_else(|_| err(line, format!("unknown block `{tok}`")))
    }

    fn operand(&self, line: usize, tok: &str, ty: Type) -> Result<Operand> {
        if tok.starts_with('%') {
            return Ok(Operand::Value(self.value(line, tok)?));
        }
        if ty.is_fp() {
            if let Some(hex) = tok.strip_prefix("0x") {
                let bits = u64::from_str_radix(hex, 16)
                    .or_else(|_| err(line, format!("bad bit pattern `{tok}`")))?;
                return Ok(match ty {
                    Type::F32 => Operand::ConstF32(bits as u32),
                    _ => Operand::ConstF64(bits),
                });
            }
            let v: f64 = tok
                .parse()
                .or_else(|_| err(line, format!("bad float literal `{tok}`")))?;
            return Ok(match ty {
                Type::F32 => Operand::ConstF32((v as f32).to_bits()),
                _ => Operand::ConstF64(v.to_bits()),
            });
        }
        let v: i64 = tok
            .parse()
            .or_else(|_| err(line, format!("bad integer literal `{tok}`")))?;
        Ok(Operand::ConstInt(v))
    }

    /// `[%base + %index*scale + disp]` or `[@sym + disp]`, any subset, in
    /// that order.
    fn address(&self, line: usize, text: &str) -> Result<AddrExpr> {
        let inner = text
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .ok_or(())
            .or_else(|_| err(line, format!("expected `[...]` address, found `{text}`")))?;
        let mut addr = AddrExpr {
            base: None,
            index: None,
            offset: 0,
            sym: None,
        };
        for part in inner.split('+').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some(name) = part.strip_prefix('@') {
                if addr.sym.is_some() {
                    return err(line, "duplicate symbol in address");
                }
                addr.sym = Some(name.to_string());
            } else if part.starts_with('%') {
                if let Some((val, scale)) = part.split_once('*') {
                    if addr.index.is_some() {
                        return err(line, "duplicate index in address");
                    }
                    let scale: u8 = scale
                        .trim()
                        .parse()
                        .or_else(|_| err(line, format!("bad scale `{scale}`")))?;
                    addr.index =
                        Some((Operand::Value(self.value(line, val.trim())?), scale));
                } else {
                    if addr.base.is_some() {
                        return err(line, "duplicate base in address");
                    }
                    addr.base = Some(Operand::Value(self.value(line, part)?));
                }
            } else {
                let disp: i32 = part
                    .parse()
                    .or_else(|_| err(line, format!("bad displacement `{part}`")))?;
                addr.offset = addr.offset.wrapping_add(disp);
            }
        }
        Ok(addr)
    }
}

fn arith_op(tok: &str) -> Option<ArithOp> {
    Some(match tok {
        "add" => ArithOp::Add,
        "sub" => ArithOp::Sub,
        "mul" => ArithOp::Mul,
        "and" => ArithOp::And,
        "or" => ArithOp::Or,
        "xor" => ArithOp::Xor,
        "shl" => ArithOp::Shl,
        "lshr" => ArithOp::Lshr,
        "ashr" => ArithOp::Ashr,
        "sdiv" => ArithOp::Sdiv,
        "udiv" => ArithOp::Udiv,
        "srem" => ArithOp::Srem,
        "urem" => ArithOp::Urem,
        "fadd" => ArithOp::Fadd,
        "fsub" => ArithOp::Fsub,
        "fmul" => ArithOp::Fmul,
        "fdiv" => ArithOp::Fdiv,
        _ => return None,
    })
}

fn cast_op(tok: &str) -> Option<CastOp> {
    Some(match tok {
        "sext" => CastOp::Sext,
        "zext" => CastOp::Zext,
        "trunc" => CastOp::Trunc,
        "sitofp" => CastOp::Sitofp,
        "fptosi" => CastOp::Fptosi,
        "fpext" => CastOp::Fpext,
        "fptrunc" => CastOp::Fptrunc,
        _ => return None,
    })
}

fn int_cond(line: usize, tok: &str) -> Result<IntCond> {
    Ok(match tok {
        "eq" => IntCond::Eq,
        "ne" => IntCond::Ne,
        "slt" => IntCond::Slt,
        "sle" => IntCond::Sle,
        "sgt" => IntCond::Sgt,
        "sge" => IntCond::Sge,
        "ult" => IntCond::Ult,
        "ule" => IntCond::Ule,
        "ugt" => IntCond::Ugt,
        "uge" => IntCond::Uge,
        other => return err(line, format!("unknown integer predicate `{other}`")),
    })
}

fn fp_cond(line: usize, tok: &str) -> Result<FpCond> {
    Ok(match tok {
        "oeq" => FpCond::Oeq,
        "one" => FpCond::One,
        "olt" => FpCond::Olt,
        "ole" => FpCond::Ole,
        "ogt" => FpCond::Ogt,
        "oge" => FpCond::Oge,
        "une" => FpCond::Une,
        other => return err(line, format!("unknown float predicate `{other}`")),
    })
}

/// `func @name(ty %p, ...) [-> ty] {` plus the body lines.
fn parse_function(line: usize, header: &str, body: &[(usize, &str)]) -> Result<Function> {
    let header = header
        .strip_prefix("func ")
        .and_then(|h| h.strip_suffix('{'))
        .ok_or(())
        .or_else(|_| err(line, "expected `func @name(...) [-> ty] {`"))?
        .trim();
    let open = header
        .find('(')
        .ok_or(())
        .or_else(|_| err(line, "missing `(`"))?;
    let close = header
        .rfind(')')
        .ok_or(())
        .or_else(|_| err(line, "missing `)`"))?;
    let name = sym_name(line, &header[..open])?.to_string();

    let mut param_names = Vec::new();
    let mut params = Vec::new();
    for part in header[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        let (ty, pname) = part
            .split_once(' ')
            .ok_or(())
            .or_else(|_| err(line, format!("expected `ty %name`, found `{part}`")))?;
        params.push(parse_type(line, ty)?);
        param_names.push(pname.trim());
    }
    let tail = header[close + 1..].trim();
    let ret = match tail.strip_prefix("->") {
        Some(ty) => Some(parse_type(line, ty.trim())?),
        None if tail.is_empty() => None,
        None => return err(line, format!("unexpected `{tail}`")),
    };

    let mut fp = FuncParser {
        func: Function::new(name, params, ret),
        values: HashMap::new(),
        blocks: HashMap::new(),
    };
    for (i, pname) in param_names.iter().enumerate() {
        let pname = pname
            .strip_prefix('%')
            .ok_or(())
            .or_else(|_| err(line, format!("expected `%name`, found `{pname}`")))?;
        if fp.values.insert(pname, ValueId(i as u32)).is_some() {
            return err(line, format!("duplicate parameter `%{pname}`"));
        }
    }

    // Labels first so branches can refer forward.
    for &(ln, text) in body {
        if let Some(label) = text.strip_suffix(':') {
            if fp.blocks.contains_key(label) {
                return err(ln, format!("duplicate block `{label}`"));
            }
            let b = fp.func.add_block(label);
            fp.blocks.insert(label, b);
        }
    }

    let mut current: Option<BlockId> = None;
    for &(ln, text) in body {
        if text.is_empty() {
            continue;
        }
        if let Some(label) = text.strip_suffix(':') {
            current = Some(fp.blocks[label]);
            continue;
        }
        let block = match current {
            Some(b) => b,
            None => return err(ln, "instruction before first block label"),
        };
        parse_inst(&mut fp, ln, text, block)?;
    }
    Ok(fp.func)
}

fn parse_inst<'a>(fp: &mut FuncParser<'a>, line: usize, text: &'a str, block: BlockId) -> Result<()> {
    if let Some((dest, rest)) = text.split_once('=') {
        let dest = dest.trim();
        let rest = rest.trim();
        let (op, args) = rest
            .split_once(' ')
            .ok_or(())
            .or_else(|_| err(line, format!("truncated instruction `{rest}`")))?;
        let kind_and_ty = parse_valued_inst(fp, line, op, args.trim())?;
        let (ty, kind) = kind_and_ty;
        let v = fp.define(line, dest, ty)?;
        fp.func.blocks[block.0 as usize]
            .insts
            .push(crate::ir::Inst {
                dest: Some(v),
                kind,
            });
        return Ok(());
    }
    let (op, args) = match text.split_once(' ') {
        Some((op, args)) => (op, args.trim()),
        None => (text, ""),
    };
    let kind = match op {
        "store" => {
            // store ty value, [addr]
            let (ty_tok, rest) = args
                .split_once(' ')
                .ok_or(())
                .or_else(|_| err(line, "expected `store ty value, [addr]`"))?;
            let ty = parse_type(line, ty_tok)?;
            let (val, addr) = rest
                .split_once(',')
                .ok_or(())
                .or_else(|_| err(line, "expected `store ty value, [addr]`"))?;
            InstKind::Store {
                ty,
                value: fp.operand(line, val.trim(), ty)?,
                addr: fp.address(line, addr.trim())?,
            }
        }
        "br" => InstKind::Br {
            target: fp.block(line, args)?,
        },
        "condbr" => {
            let toks: Vec<&str> = args.split(',').map(str::trim).collect();
            if toks.len() != 3 {
                return err(line, "expected `condbr %c, then, else`");
            }
            InstKind::CondBr {
                cond: fp.operand(line, toks[0], Type::I1)?,
                then_blk: fp.block(line, toks[1])?,
                else_blk: fp.block(line, toks[2])?,
            }
        }
        "ret" => {
            if args.is_empty() {
                InstKind::Ret { value: None }
            } else {
                let (ty_tok, val) = args
                    .split_once(' ')
                    .ok_or(())
                    .or_else(|_| err(line, "expected `ret ty value`"))?;
                let ty = parse_type(line, ty_tok)?;
                InstKind::Ret {
                    value: Some(fp.operand(line, val.trim(), ty)?),
                }
            }
        }
        "call" => parse_call(fp, line, args, None)?,
        other => return err(line, format!("unknown instruction `{other}`")),
    };
    fp.func.blocks[block.0 as usize]
        .insts
        .push(crate::ir::Inst { dest: None, kind });
    Ok(())
}

/// Instructions of the form `%x = <op> ...`. Returns the destination type.
fn parse_valued_inst<'a>(
    fp: &mut FuncParser<'a>,
    line: usize,
    op: &str,
    args: &str,
) -> Result<(Type, InstKind)> {
    if let Some(aop) = arith_op(op) {
        let (ty_tok, rest) = args
            .split_once(' ')
            .ok_or(())
            .or_else(|_| err(line, "expected `ty a, b`"))?;
        let ty = parse_type(line, ty_tok)?;
        let (a, b) = rest
            .split_once(',')
            .ok_or(())
            .or_else(|_| err(line, "expected two operands"))?;
        return Ok((
            ty,
            InstKind::Arith {
                op: aop,
                ty,
                a: fp.operand(line, a.trim(), ty)?,
                b: fp.operand(line, b.trim(), ty)?,
            },
        ));
    }
    if let Some(cop) = cast_op(op) {
        // <op> from_ty %v to to_ty
        let toks: Vec<&str> = args.split_whitespace().collect();
        if toks.len() != 4 || toks[2] != "to" {
            return err(line, "expected `from_ty %v to to_ty`");
        }
        let from = parse_type(line, toks[0])?;
        let to = parse_type(line, toks[3])?;
        return Ok((
            to,
            InstKind::Cast {
                op: cop,
                from,
                to,
                src: fp.operand(line, toks[1], from)?,
            },
        ));
    }
    match op {
        "icmp" | "fcmp" => {
            let toks: Vec<&str> = args.splitn(3, ' ').collect();
            if toks.len() != 3 {
                return err(line, "expected `pred ty a, b`");
            }
            let ty = parse_type(line, toks[1])?;
            let (a, b) = toks[2]
                .split_once(',')
                .ok_or(())
                .or_else(|_| err(line, "expected two operands"))?;
            let a = fp.operand(line, a.trim(), ty)?;
            let b = fp.operand(line, b.trim(), ty)?;
            let kind = if op == "icmp" {
                InstKind::Icmp {
                    cond: int_cond(line, toks[0])?,
                    ty,
                    a,
                    b,
                }
            } else {
                InstKind::Fcmp {
                    cond: fp_cond(line, toks[0])?,
                    ty,
                    a,
                    b,
                }
            };
            Ok((Type::I1, kind))
        }
        "load" => {
            let (ty_tok, addr) = args
                .split_once(' ')
                .ok_or(())
                .or_else(|_| err(line, "expected `load ty [addr]`"))?;
            let ty = parse_type(line, ty_tok)?;
            Ok((
                ty,
                InstKind::Load {
                    ty,
                    addr: fp.address(line, addr.trim())?,
                },
            ))
        }
        "copy" => {
            let (ty_tok, val) = args
                .split_once(' ')
                .ok_or(())
                .or_else(|_| err(line, "expected `copy ty value`"))?;
            let ty = parse_type(line, ty_tok)?;
            Ok((
                ty,
                InstKind::Copy {
                    ty,
                    src: fp.operand(line, val.trim(), ty)?,
                },
            ))
        }
        "call" => {
            let (ty_tok, rest) = args
                .split_once(' ')
                .ok_or(())
                .or_else(|_| err(line, "expected `call ty @f(...)`"))?;
            let ty = parse_type(line, ty_tok)?;
            let kind = parse_call(fp, line, rest.trim(), Some(ty))?;
            Ok((ty, kind))
        }
        other => err(line, format!("unknown instruction `{other}`")),
    }
}

/// `@f(ty arg, ...)`; `ret` is the destination type when the call produces
/// a value.
fn parse_call(fp: &FuncParser<'_>, line: usize, text: &str, ret: Option<Type>) -> Result<InstKind> {
    let open = text
        .find('(')
        .ok_or(())
        .or_else(|_| err(line, "missing `(`"))?;
    let close = text
        .rfind(')')
        .ok_or(())
        .or_else(|_| err(line, "missing `)`"))?;
    let callee = sym_name(line, text[..open].trim())?.to_string();
    let mut args = Vec::new();
    for part in text[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        let (ty_tok, val) = part
            .split_once(' ')
            .ok_or(())
            .or_else(|_| err(line, format!("expected `ty value`, found `{part}`")))?;
        let ty = parse_type(line, ty_tok)?;
        args.push((ty, fp.operand(line, val.trim(), ty)?));
    }
    Ok(InstKind::Call { callee, args, ret })
}
