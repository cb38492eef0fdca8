//! EIR to LIR lowering: nested expression trees into basic-block SSA.
//!
//! Lowering is demand-driven from the result node. The context assembles
//! one open block at a time; every block is sealed with exactly one
//! terminator, block ids are `bb0, bb1, ...` in allocation order, and the
//! finished list is sorted by id so numbering and order coincide.
//!
//! Inline sub-expressions are always pulled out into prior instructions
//! bound to fresh `__tN` temporaries, so `assign` values never contain
//! EIR or async kinds.
//!
//! Async operations lower to `effect` instructions by default. With
//! [`LowerOptions::async_blocks`] they lower to the richer block forms:
//! `spawn`/`await`/`channelOp` instructions, `fork`/`join` terminators for
//! `par`, and `suspend` for `await`.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use smallvec::SmallVec;

use spiral_core::document::Document;
use spiral_core::error::SpiralError;
use spiral_core::expr::{Arg, Expr};
use spiral_core::node::{
    BasicBlock, ChannelOpKind, ForkBranch, Instruction, Node, NodeBody, Terminator,
};
use spiral_core::types::SpiralType;

/// Options controlling the async emission strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowerOptions {
    /// Emit `spawn`/`await`/`channelOp` instructions and `fork`/`join`/
    /// `suspend` terminators instead of `effect` instructions.
    pub async_blocks: bool,
}

/// Lowers an EIR document to a single LIR block node (default emission).
pub fn lower_program(doc: &Document) -> Result<Document, SpiralError> {
    lower_program_with(doc, LowerOptions::default())
}

/// Lowers with explicit options.
pub fn lower_program_with(doc: &Document, options: LowerOptions) -> Result<Document, SpiralError> {
    let mut ctx = LowerCtx::new(doc, options);
    ctx.start_fresh_block();
    let result_var = ctx.lower_node(&doc.result)?;
    ctx.seal(Terminator::Return {
        value: Some(result_var),
    });
    let blocks = ctx.finish();

    let result_ty = doc
        .node(&doc.result)
        .and_then(Node::declared_type)
        .cloned();
    let block_node = Node {
        id: doc.result.clone(),
        body: NodeBody::Blocks {
            blocks,
            entry: "bb0".into(),
            ty: result_ty,
        },
    };

    Ok(Document {
        version: doc.version.clone(),
        capabilities: doc.capabilities.clone(),
        function_sigs: doc.function_sigs.clone(),
        air_defs: Vec::new(),
        nodes: vec![block_node],
        result: doc.result.clone(),
    })
}

struct OpenBlock {
    index: usize,
    instructions: Vec<Instruction>,
}

struct LowerCtx<'a> {
    nodes: IndexMap<&'a str, &'a Node>,
    options: LowerOptions,
    /// Sealed blocks by index; `None` slots are reserved but unfilled.
    slots: Vec<Option<BasicBlock>>,
    current: Option<OpenBlock>,
    next_tmp: usize,
    /// Node id -> variable holding its value.
    lowered: HashMap<String, String>,
    /// Targets that have been taken as reference cells; assignments to them
    /// store through the cell.
    ref_cells: HashSet<String>,
}

fn void_lit() -> Expr {
    Expr::Lit {
        ty: SpiralType::Void,
        value: serde_json::Value::Null,
    }
}

fn args_of(vars: Vec<String>) -> SmallVec<[String; 4]> {
    vars.into_iter().collect()
}

impl<'a> LowerCtx<'a> {
    fn new(doc: &'a Document, options: LowerOptions) -> Self {
        LowerCtx {
            nodes: doc.nodes.iter().map(|n| (n.id.as_str(), n)).collect(),
            options,
            slots: Vec::new(),
            current: None,
            next_tmp: 0,
            lowered: HashMap::new(),
            ref_cells: HashSet::new(),
        }
    }

    fn block_id(index: usize) -> String {
        format!("bb{index}")
    }

    /// Allocates a block id without opening it.
    fn reserve_block(&mut self) -> String {
        let index = self.slots.len();
        self.slots.push(None);
        Self::block_id(index)
    }

    /// Allocates and opens a new block.
    fn start_fresh_block(&mut self) -> String {
        let id = self.reserve_block();
        self.start_reserved(&id);
        id
    }

    fn start_reserved(&mut self, id: &str) {
        debug_assert!(self.current.is_none(), "a block is already open");
        let index: usize = id
            .strip_prefix("bb")
            .and_then(|s| s.parse().ok())
            .expect("reserved block ids are bbN");
        self.current = Some(OpenBlock {
            index,
            instructions: Vec::new(),
        });
    }

    fn emit(&mut self, instruction: Instruction) {
        self.current
            .as_mut()
            .expect("no open block")
            .instructions
            .push(instruction);
    }

    fn seal(&mut self, terminator: Terminator) {
        let open = self.current.take().expect("no open block to seal");
        self.slots[open.index] = Some(BasicBlock {
            id: Self::block_id(open.index),
            instructions: open.instructions,
            terminator,
        });
    }

    fn finish(self) -> Vec<BasicBlock> {
        debug_assert!(self.current.is_none(), "unsealed block at finish");
        self.slots.into_iter().flatten().collect()
    }

    fn fresh_tmp(&mut self) -> String {
        let tmp = format!("__t{}", self.next_tmp);
        self.next_tmp += 1;
        tmp
    }

    fn assign_var(&mut self, target: &str, source: String) {
        self.emit(Instruction::Assign {
            target: target.to_string(),
            value: Expr::Var { name: source },
        });
    }

    /// Lowers a referenced node once; later references reuse its variable.
    fn lower_node(&mut self, id: &str) -> Result<String, SpiralError> {
        if let Some(var) = self.lowered.get(id) {
            return Ok(var.clone());
        }
        let Some(node) = self.nodes.get(id).copied() else {
            return Err(SpiralError::validation(format!(
                "node '{id}' does not exist"
            )));
        };
        let expr = match &node.body {
            NodeBody::Expr { expr, .. } => expr.clone(),
            NodeBody::Ref { pointer } => {
                return Err(SpiralError::validation(format!(
                    "node '{id}': resolve reference '{pointer}' before lowering"
                )))
            }
            NodeBody::Blocks { .. } => {
                return Err(SpiralError::validation(format!(
                    "node '{id}' is already in block form"
                )))
            }
        };
        self.lowered.insert(id.to_string(), id.to_string());
        self.lower_expr(id, &expr)?;
        Ok(id.to_string())
    }

    /// Lowers an argument position, returning the variable that holds its
    /// value. Bound names pass through as variables.
    fn lower_arg(&mut self, arg: &Arg) -> Result<String, SpiralError> {
        match arg {
            Arg::Node(id) => {
                if self.nodes.contains_key(id.as_str()) {
                    self.lower_node(id)
                } else {
                    // A lambda parameter or loop/let-bound name: already a
                    // variable in scope.
                    Ok(id.clone())
                }
            }
            Arg::Inline(expr) => match expr.as_ref() {
                // A bare variable needs no intermediate assignment.
                Expr::Var { name } => Ok(name.clone()),
                other => {
                    let tmp = self.fresh_tmp();
                    self.lower_expr(&tmp, other)?;
                    Ok(tmp)
                }
            },
        }
    }

    /// Lowers `expr`, leaving its value in `target`.
    fn lower_expr(&mut self, target: &str, expr: &Expr) -> Result<(), SpiralError> {
        match expr {
            Expr::Lit { .. } => {
                self.emit(Instruction::Assign {
                    target: target.to_string(),
                    value: expr.clone(),
                });
                Ok(())
            }

            Expr::Ref { id } => {
                let var = self.lower_arg(&Arg::Node(id.clone()))?;
                self.assign_var(target, var);
                Ok(())
            }

            Expr::Var { name } => {
                self.assign_var(target, name.clone());
                Ok(())
            }

            Expr::Call { ns, name, args } => {
                let mut vars = Vec::with_capacity(args.len());
                for arg in args {
                    vars.push(self.lower_arg(arg)?);
                }
                self.emit(Instruction::Op {
                    target: target.to_string(),
                    ns: ns.clone(),
                    name: name.clone(),
                    args: args_of(vars),
                });
                Ok(())
            }

            Expr::If {
                cond,
                then,
                otherwise,
                ..
            } => {
                let cond_var = self.lower_arg(cond)?;
                let then_id = self.reserve_block();
                let else_id = self.reserve_block();
                let join_id = self.reserve_block();
                self.seal(Terminator::Branch {
                    cond: cond_var,
                    then: then_id.clone(),
                    otherwise: else_id.clone(),
                });

                self.start_reserved(&then_id);
                let then_var = self.lower_arg(then)?;
                self.assign_var(target, then_var);
                self.seal(Terminator::Jump {
                    to: join_id.clone(),
                });

                self.start_reserved(&else_id);
                let else_var = self.lower_arg(otherwise)?;
                self.assign_var(target, else_var);
                self.seal(Terminator::Jump {
                    to: join_id.clone(),
                });

                self.start_reserved(&join_id);
                Ok(())
            }

            Expr::Let { name, value, body } => {
                let value_var = self.lower_arg(value)?;
                self.assign_var(name, value_var);
                let body_id = self.reserve_block();
                self.seal(Terminator::Jump {
                    to: body_id.clone(),
                });
                self.start_reserved(&body_id);
                let body_var = self.lower_arg(body)?;
                self.assign_var(target, body_var);
                Ok(())
            }

            Expr::Seq { first, then } => {
                self.lower_arg(first)?;
                let then_id = self.reserve_block();
                self.seal(Terminator::Jump {
                    to: then_id.clone(),
                });
                self.start_reserved(&then_id);
                let then_var = self.lower_arg(then)?;
                self.assign_var(target, then_var);
                Ok(())
            }

            Expr::Assign {
                target: slot,
                value,
            } => {
                let value_var = self.lower_arg(value)?;
                if self.ref_cells.contains(slot) {
                    self.emit(Instruction::AssignRef {
                        target: slot.clone(),
                        value: value_var,
                    });
                } else {
                    self.assign_var(slot, value_var);
                }
                self.emit(Instruction::Assign {
                    target: target.to_string(),
                    value: void_lit(),
                });
                Ok(())
            }

            Expr::While { cond, body } => {
                let header = self.reserve_block();
                let body_id = self.reserve_block();
                let exit = self.reserve_block();
                self.seal(Terminator::Jump {
                    to: header.clone(),
                });

                self.start_reserved(&header);
                let cond_var = self.lower_arg(cond)?;
                self.seal(Terminator::Branch {
                    cond: cond_var,
                    then: body_id.clone(),
                    otherwise: exit.clone(),
                });

                self.start_reserved(&body_id);
                self.lower_arg(body)?;
                self.seal(Terminator::Jump {
                    to: header.clone(),
                });

                self.start_reserved(&exit);
                self.emit(Instruction::Assign {
                    target: target.to_string(),
                    value: void_lit(),
                });
                Ok(())
            }

            Expr::For {
                var,
                init,
                cond,
                update,
                body,
            } => {
                let init_var = self.lower_arg(init)?;
                self.assign_var(var, init_var);

                let header = self.reserve_block();
                let body_id = self.reserve_block();
                let update_id = self.reserve_block();
                let exit = self.reserve_block();
                self.seal(Terminator::Jump {
                    to: header.clone(),
                });

                self.start_reserved(&header);
                let cond_var = self.lower_arg(cond)?;
                self.seal(Terminator::Branch {
                    cond: cond_var,
                    then: body_id.clone(),
                    otherwise: exit.clone(),
                });

                self.start_reserved(&body_id);
                self.lower_arg(body)?;
                self.seal(Terminator::Jump {
                    to: update_id.clone(),
                });

                self.start_reserved(&update_id);
                let update_var = self.lower_arg(update)?;
                self.assign_var(var, update_var);
                self.seal(Terminator::Jump {
                    to: header.clone(),
                });

                self.start_reserved(&exit);
                self.emit(Instruction::Assign {
                    target: target.to_string(),
                    value: void_lit(),
                });
                Ok(())
            }

            Expr::Iter { var, iter, body } => {
                let iter_var = self.lower_arg(iter)?;

                let header = self.reserve_block();
                let body_id = self.reserve_block();
                let exit = self.reserve_block();
                self.seal(Terminator::Jump {
                    to: header.clone(),
                });

                self.start_reserved(&header);
                let has_next = self.fresh_tmp();
                self.emit(Instruction::Op {
                    target: has_next.clone(),
                    ns: "iter".into(),
                    name: "hasNext".into(),
                    args: args_of(vec![iter_var.clone()]),
                });
                self.seal(Terminator::Branch {
                    cond: has_next,
                    then: body_id.clone(),
                    otherwise: exit.clone(),
                });

                self.start_reserved(&body_id);
                self.emit(Instruction::Op {
                    target: var.clone(),
                    ns: "iter".into(),
                    name: "next".into(),
                    args: args_of(vec![iter_var]),
                });
                self.lower_arg(body)?;
                self.seal(Terminator::Jump {
                    to: header.clone(),
                });

                self.start_reserved(&exit);
                self.emit(Instruction::Assign {
                    target: target.to_string(),
                    value: void_lit(),
                });
                Ok(())
            }

            Expr::Effect { op, args } => {
                let mut vars = Vec::with_capacity(args.len());
                for arg in args {
                    vars.push(self.lower_arg(arg)?);
                }
                self.emit(Instruction::Effect {
                    target: Some(target.to_string()),
                    op: op.clone(),
                    args: args_of(vars),
                });
                Ok(())
            }

            Expr::RefCell { target: slot } => {
                self.ref_cells.insert(slot.clone());
                self.assign_var(target, slot.clone());
                Ok(())
            }

            Expr::Deref { target: slot } => {
                self.assign_var(target, slot.clone());
                Ok(())
            }

            Expr::Try {
                try_body,
                catch_param,
                catch_body,
                fallback,
            } => self.lower_try(target, try_body, catch_param, catch_body, fallback.as_ref()),

            // -- CIR kinds that survive into LIR assign positions ----------
            Expr::Lambda { .. }
            | Expr::CallExpr { .. }
            | Expr::Fix { .. }
            | Expr::Predicate { .. }
            | Expr::Match { .. }
            | Expr::Record { .. }
            | Expr::ListOf { .. } => {
                self.emit(Instruction::Assign {
                    target: target.to_string(),
                    value: expr.clone(),
                });
                Ok(())
            }

            Expr::Do { exprs } => {
                let mut last = None;
                for arg in exprs {
                    last = Some(self.lower_arg(arg)?);
                }
                match last {
                    Some(var) => self.assign_var(target, var),
                    None => self.emit(Instruction::Assign {
                        target: target.to_string(),
                        value: void_lit(),
                    }),
                }
                Ok(())
            }

            Expr::AirRef { ns, name, .. } => Err(SpiralError::validation(format!(
                "airRef '{ns}:{name}' must be desugared before lowering"
            ))),

            // -- async ----------------------------------------------------
            Expr::Spawn { task } => {
                if self.options.async_blocks {
                    let entry = self.lower_task_chain(task)?;
                    self.emit(Instruction::Spawn {
                        target: target.to_string(),
                        entry,
                        args: None,
                    });
                } else {
                    self.emit(Instruction::Effect {
                        target: Some(target.to_string()),
                        op: "spawn".into(),
                        args: args_of(vec![task.clone()]),
                    });
                }
                Ok(())
            }

            Expr::Await { future, .. } => {
                let future_var = self.lower_arg(future)?;
                if self.options.async_blocks {
                    let resume = self.reserve_block();
                    self.seal(Terminator::Suspend {
                        future: future_var.clone(),
                        resume_block: resume.clone(),
                    });
                    self.start_reserved(&resume);
                    self.emit(Instruction::Await {
                        target: target.to_string(),
                        future: future_var,
                    });
                } else {
                    self.emit(Instruction::Effect {
                        target: Some(target.to_string()),
                        op: "await".into(),
                        args: args_of(vec![future_var]),
                    });
                }
                Ok(())
            }

            Expr::Par { branches } => {
                if self.options.async_blocks {
                    self.lower_par_fork(target, branches)
                } else {
                    self.emit(Instruction::Effect {
                        target: Some(target.to_string()),
                        op: "par".into(),
                        args: branches.iter().cloned().collect(),
                    });
                    Ok(())
                }
            }

            Expr::Channel {
                channel_type,
                buffer_size,
            } => {
                let mut args = vec![channel_type.to_string()];
                if let Some(size) = buffer_size {
                    args.push(size.to_string());
                }
                self.emit(Instruction::Effect {
                    target: Some(target.to_string()),
                    op: "channel".into(),
                    args: args_of(args),
                });
                Ok(())
            }

            Expr::Send { channel, value } => {
                let channel_var = self.lower_arg(channel)?;
                let value_var = self.lower_arg(value)?;
                if self.options.async_blocks {
                    self.emit(Instruction::ChannelOp {
                        op: ChannelOpKind::Send,
                        target: None,
                        channel: channel_var,
                        value: Some(value_var),
                    });
                } else {
                    self.emit(Instruction::Effect {
                        target: None,
                        op: "send".into(),
                        args: args_of(vec![channel_var, value_var]),
                    });
                }
                self.emit(Instruction::Assign {
                    target: target.to_string(),
                    value: void_lit(),
                });
                Ok(())
            }

            Expr::Recv { channel } => {
                let channel_var = self.lower_arg(channel)?;
                if self.options.async_blocks {
                    self.emit(Instruction::ChannelOp {
                        op: ChannelOpKind::Recv,
                        target: Some(target.to_string()),
                        channel: channel_var,
                        value: None,
                    });
                } else {
                    self.emit(Instruction::Effect {
                        target: Some(target.to_string()),
                        op: "recv".into(),
                        args: args_of(vec![channel_var]),
                    });
                }
                Ok(())
            }

            Expr::Select { futures, .. } => {
                self.emit(Instruction::Effect {
                    target: Some(target.to_string()),
                    op: "select".into(),
                    args: futures.iter().cloned().collect(),
                });
                Ok(())
            }

            Expr::Race { tasks } => {
                self.emit(Instruction::Effect {
                    target: Some(target.to_string()),
                    op: "race".into(),
                    args: tasks.iter().cloned().collect(),
                });
                Ok(())
            }
        }
    }

    fn lower_try(
        &mut self,
        target: &str,
        try_body: &Arg,
        catch_param: &str,
        catch_body: &Arg,
        fallback: Option<&Arg>,
    ) -> Result<(), SpiralError> {
        let try_var = self.lower_arg(try_body)?;
        self.assign_var(target, try_var.clone());
        let failed = self.fresh_tmp();
        self.emit(Instruction::Op {
            target: failed.clone(),
            ns: "core".into(),
            name: "isError".into(),
            args: args_of(vec![try_var.clone()]),
        });

        let catch_id = self.reserve_block();
        let join_id = self.reserve_block();
        self.seal(Terminator::Branch {
            cond: failed,
            then: catch_id.clone(),
            otherwise: join_id.clone(),
        });

        self.start_reserved(&catch_id);
        self.assign_var(catch_param, try_var);
        let catch_var = self.lower_arg(catch_body)?;
        self.assign_var(target, catch_var.clone());

        match fallback {
            None => {
                self.seal(Terminator::Jump {
                    to: join_id.clone(),
                });
            }
            Some(fallback) => {
                let catch_failed = self.fresh_tmp();
                self.emit(Instruction::Op {
                    target: catch_failed.clone(),
                    ns: "core".into(),
                    name: "isError".into(),
                    args: args_of(vec![catch_var]),
                });
                let fallback_id = self.reserve_block();
                self.seal(Terminator::Branch {
                    cond: catch_failed,
                    then: fallback_id.clone(),
                    otherwise: join_id.clone(),
                });
                self.start_reserved(&fallback_id);
                let fallback_var = self.lower_arg(fallback)?;
                self.assign_var(target, fallback_var);
                self.seal(Terminator::Jump {
                    to: join_id.clone(),
                });
            }
        }

        self.start_reserved(&join_id);
        Ok(())
    }

    /// Lowers a task node into its own block chain ending with a return of
    /// the task's value; used by the block-form `spawn`.
    fn lower_task_chain(&mut self, task: &str) -> Result<String, SpiralError> {
        let saved = self.current.take();
        let entry = self.start_fresh_block();
        let task_var = self.lower_node(task)?;
        self.seal(Terminator::Return {
            value: Some(task_var),
        });
        self.current = saved;
        Ok(entry)
    }

    /// Block-form `par`: fork into one chain per branch, then join and
    /// collect the results.
    fn lower_par_fork(&mut self, target: &str, branches: &[String]) -> Result<(), SpiralError> {
        let mut forks = Vec::with_capacity(branches.len());
        let mut tasks = Vec::with_capacity(branches.len());
        let mut results = Vec::with_capacity(branches.len());
        for branch in branches {
            let entry = self.lower_task_chain(branch)?;
            let task_name = self.fresh_tmp();
            results.push(branch.clone());
            forks.push(ForkBranch {
                block: entry,
                task: task_name.clone(),
            });
            tasks.push(task_name);
        }

        let join_block = self.reserve_block();
        let after = self.reserve_block();
        self.seal(Terminator::Fork {
            branches: forks,
            continuation: join_block.clone(),
        });

        self.start_reserved(&join_block);
        self.seal(Terminator::Join {
            tasks,
            results: Some(results.clone()),
            to: after.clone(),
        });

        self.start_reserved(&after);
        self.emit(Instruction::Assign {
            target: target.to_string(),
            value: Expr::ListOf {
                elements: results.into_iter().map(Arg::Node).collect(),
            },
        });
        Ok(())
    }
}
