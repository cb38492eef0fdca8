//! EIR extension of the type checker: mutation, loops, effects, and the
//! async kinds.
//!
//! Mutation typing threads a mutable-slot map: `assign{target, value}`
//! records `target -> type(value)`, later `var`/`ref` uses of the target
//! read it back, `refCell` wraps it in `ref<T>`, and `deref` unwraps it.
//! Loop forms and the async kinds type as `void`; `seq` takes its `then`
//! type and `try` joins its body and catch types.

use spiral_core::env::TypeEnv;
use spiral_core::error::SpiralError;
use spiral_core::expr::{Arg, Expr};
use spiral_core::types::SpiralType;

use super::Checker;

impl Checker<'_> {
    pub(crate) fn check_eir_expr(
        &mut self,
        expr: &Expr,
        env: &TypeEnv,
    ) -> Result<SpiralType, SpiralError> {
        match expr {
            Expr::Seq { first, then } => {
                self.arg_type(first, env)?;
                Ok(self.arg_type(then, env)?.unwrap_or(SpiralType::Int))
            }

            Expr::Assign { target, value } => {
                let value_ty = self.arg_type(value, env)?.unwrap_or(SpiralType::Int);
                self.mutable.insert(target.clone(), value_ty);
                Ok(SpiralType::Void)
            }

            Expr::While { cond, body } => {
                if let Some(t) = self.arg_type(cond, env)? {
                    self.expect_type(&SpiralType::Bool, &t)?;
                }
                self.arg_type(body, env)?;
                Ok(SpiralType::Void)
            }

            Expr::For {
                var,
                init,
                cond,
                update,
                body,
            } => {
                let init_ty = self.arg_type(init, env)?.unwrap_or(SpiralType::Int);
                self.mutable.insert(var.clone(), init_ty);
                if let Some(t) = self.arg_type(cond, env)? {
                    self.expect_type(&SpiralType::Bool, &t)?;
                }
                self.arg_type(update, env)?;
                self.arg_type(body, env)?;
                Ok(SpiralType::Void)
            }

            Expr::Iter { var, iter, body } => {
                let element = match self.arg_type(iter, env)? {
                    Some(SpiralType::List { of }) => *of,
                    Some(other) => {
                        return Err(SpiralError::TypeMismatch {
                            context: self.context(),
                            expected: "list<_>".into(),
                            actual: other.to_string(),
                        })
                    }
                    None => SpiralType::Int,
                };
                self.mutable.insert(var.clone(), element);
                self.arg_type(body, env)?;
                Ok(SpiralType::Void)
            }

            Expr::Effect { op, args } => {
                for arg in args {
                    self.arg_type(arg, env)?;
                }
                // The declared return of the effect op, void when the op is
                // not registered.
                Ok(self
                    .registry()
                    .lookup("effect", op)
                    .map(|o| o.returns.clone())
                    .unwrap_or(SpiralType::Void))
            }

            Expr::RefCell { target } => match self.mutable.get(target) {
                Some(t) => Ok(SpiralType::reference(t.clone())),
                None => Err(SpiralError::UnboundIdentifier {
                    name: target.clone(),
                }),
            },

            Expr::Deref { target } => match self.mutable.get(target) {
                Some(t) => Ok(t.clone()),
                None => Err(SpiralError::UnboundIdentifier {
                    name: target.clone(),
                }),
            },

            Expr::Try {
                try_body,
                catch_param,
                catch_body,
                fallback,
            } => {
                let try_ty = self.arg_type(try_body, env)?.unwrap_or(SpiralType::Int);
                let inner = env.extend(catch_param.clone(), SpiralType::opaque("error"));
                if let Some(catch_ty) = self.arg_type(catch_body, &inner)? {
                    self.expect_type(&try_ty, &catch_ty)?;
                }
                if let Some(f) = fallback {
                    if let Some(fallback_ty) = self.arg_type(f, env)? {
                        self.expect_type(&try_ty, &fallback_ty)?;
                    }
                }
                Ok(try_ty)
            }

            // Async kinds: arguments are checked for well-formedness; the
            // layered result type is void, richer typing lives with the
            // runtime semantics.
            Expr::Await {
                future, fallback, ..
            } => {
                self.arg_type(future, env)?;
                if let Some(f) = fallback {
                    self.arg_type(f, env)?;
                }
                Ok(SpiralType::Void)
            }
            Expr::Send { channel, value } => {
                self.arg_type(channel, env)?;
                self.arg_type(value, env)?;
                Ok(SpiralType::Void)
            }
            Expr::Recv { channel } => {
                self.arg_type(channel, env)?;
                Ok(SpiralType::Void)
            }
            Expr::Select { fallback, .. } => {
                if let Some(f) = fallback.clone() {
                    self.arg_type(&f, env)?;
                }
                Ok(SpiralType::Void)
            }
            Expr::Par { .. }
            | Expr::Spawn { .. }
            | Expr::Channel { .. }
            | Expr::Race { .. } => Ok(SpiralType::Void),

            other => Err(SpiralError::validation(format!(
                "{}: '{}' is not an EIR expression",
                self.context(),
                other.kind_name()
            ))),
        }
    }
}
