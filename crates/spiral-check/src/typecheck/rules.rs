//! Per-kind type rules for the pure layers (AIR and CIR).
//!
//! Dispatch is an exhaustive match with no wildcard arm; the EIR and async
//! kinds are forwarded to the extension in `eir.rs`. Checking is
//! bidirectional wherever a position carries an expected type (call
//! arguments, `if` branches): the sub-expression is computed and compared.

use spiral_core::env::TypeEnv;
use spiral_core::error::SpiralError;
use spiral_core::expr::{Arg, Expr, MatchCase, RecordField};
use spiral_core::node::NodeBody;
use spiral_core::types::SpiralType;

use crate::diagnostics::suggest_name;

use super::Checker;

impl Checker<'_> {
    /// The type of an argument position, when it is determinable now.
    ///
    /// Inline expressions always compute. Node references use the running
    /// type map, then the mutable-slot map, then the environment; a
    /// reference to a lambda parameter or bound node that has no type yet is
    /// `None` (deferred), and a reference to nothing at all is an error.
    pub(crate) fn arg_type(
        &mut self,
        arg: &Arg,
        env: &TypeEnv,
    ) -> Result<Option<SpiralType>, SpiralError> {
        match arg {
            Arg::Inline(e) => Ok(Some(self.check_expr(e, env)?)),
            Arg::Node(id) => {
                if let Some(t) = env.lookup(id) {
                    return Ok(Some(t.clone()));
                }
                if let Some(t) = self.node_types.get(id) {
                    return Ok(Some(t.clone()));
                }
                if let Some(t) = self.mutable.get(id) {
                    return Ok(Some(t.clone()));
                }
                if self.is_deferred_name(id) || self.has_node(id) {
                    return Ok(None);
                }
                Err(SpiralError::validation(format!(
                    "{}: reference to unknown id '{id}'",
                    self.context()
                )))
            }
        }
    }

    pub(crate) fn expect_type(
        &self,
        expected: &SpiralType,
        actual: &SpiralType,
    ) -> Result<(), SpiralError> {
        if expected == actual {
            Ok(())
        } else {
            Err(SpiralError::TypeMismatch {
                context: self.context(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    /// Checks an argument against an expected type when its type is
    /// determinable; deferred references pass.
    pub(crate) fn check_arg_against(
        &mut self,
        arg: &Arg,
        expected: &SpiralType,
        env: &TypeEnv,
    ) -> Result<(), SpiralError> {
        match self.arg_type(arg, env)? {
            Some(actual) => self.expect_type(expected, &actual),
            None => Ok(()),
        }
    }

    pub(crate) fn check_expr(
        &mut self,
        expr: &Expr,
        env: &TypeEnv,
    ) -> Result<SpiralType, SpiralError> {
        match expr {
            Expr::Lit { ty, .. } => Ok(ty.clone()),

            Expr::Var { name } => Ok(env
                .lookup(name)
                .cloned()
                .or_else(|| self.mutable.get(name).cloned())
                .unwrap_or(SpiralType::Int)),

            Expr::Ref { id } => {
                if let Some(t) = self.node_types.get(id) {
                    return Ok(t.clone());
                }
                if let Some(t) = self.mutable.get(id) {
                    return Ok(t.clone());
                }
                if self.is_deferred_name(id) {
                    return Ok(SpiralType::Int);
                }
                Err(SpiralError::validation(format!(
                    "{}: reference to un-typed node '{id}'",
                    self.context()
                )))
            }

            Expr::Call { ns, name, args } => self.check_call(ns, name, args, env),

            Expr::If {
                cond,
                then,
                otherwise,
                ty,
            } => {
                if let Some(cond_ty) = self.arg_type(cond, env)? {
                    self.expect_type(&SpiralType::Bool, &cond_ty)?;
                }
                let declared = ty.clone().unwrap_or(SpiralType::Int);
                self.check_arg_against(then, &declared, env)?;
                self.check_arg_against(otherwise, &declared, env)?;
                Ok(declared)
            }

            Expr::Let { name, value, body } => {
                let value_ty = self.arg_type(value, env)?.unwrap_or(SpiralType::Int);
                let inner = env.extend(name.clone(), value_ty);
                Ok(self.arg_type(body, &inner)?.unwrap_or(SpiralType::Int))
            }

            Expr::AirRef { ns, name, args } => self.check_airref(ns, name, args),

            Expr::Predicate { value, .. } => {
                self.arg_type(value, env)?;
                Ok(SpiralType::Bool)
            }

            Expr::Lambda { params, body, ty } => self.check_lambda(params, body, ty, env),

            Expr::CallExpr { func, args } => self.check_callexpr(func, args, env),

            Expr::Fix { func, ty } => self.check_fix(func, ty),

            Expr::Do { exprs } => {
                let mut last = SpiralType::Void;
                for arg in exprs {
                    last = self.arg_type(arg, env)?.unwrap_or(SpiralType::Int);
                }
                Ok(last)
            }

            Expr::Match {
                value,
                cases,
                default,
            } => self.check_match(value, cases, default.as_ref(), env),

            Expr::Record { fields } => self.check_record(fields, env),

            Expr::ListOf { elements } => {
                let mut element_ty: Option<SpiralType> = None;
                for e in elements {
                    if let Some(t) = self.arg_type(e, env)? {
                        match &element_ty {
                            Some(existing) => self.expect_type(existing, &t)?,
                            None => element_ty = Some(t),
                        }
                    }
                }
                Ok(SpiralType::list(element_ty.unwrap_or(SpiralType::Int)))
            }

            // EIR and async kinds live in the extension.
            Expr::Seq { .. }
            | Expr::Assign { .. }
            | Expr::While { .. }
            | Expr::For { .. }
            | Expr::Iter { .. }
            | Expr::Effect { .. }
            | Expr::RefCell { .. }
            | Expr::Deref { .. }
            | Expr::Try { .. }
            | Expr::Par { .. }
            | Expr::Spawn { .. }
            | Expr::Await { .. }
            | Expr::Channel { .. }
            | Expr::Send { .. }
            | Expr::Recv { .. }
            | Expr::Select { .. }
            | Expr::Race { .. } => self.check_eir_expr(expr, env),
        }
    }

    fn check_call(
        &mut self,
        ns: &str,
        name: &str,
        args: &[Arg],
        env: &TypeEnv,
    ) -> Result<SpiralType, SpiralError> {
        let signature = self
            .registry()
            .lookup(ns, name)
            .map(|op| (op.params.clone(), op.returns.clone()));
        let Some((params, returns)) = signature else {
            let suggestion = suggest_name(
                &format!("{ns}:{name}"),
                self.registry().names().iter().copied(),
            );
            return Err(SpiralError::UnknownOperator {
                ns: ns.to_string(),
                name: name.to_string(),
                suggestion,
            });
        };

        if args.len() != params.len() {
            return Err(SpiralError::Arity {
                context: format!("{} (call {ns}:{name})", self.context()),
                expected: params.len(),
                actual: args.len(),
            });
        }
        for (arg, param) in args.iter().zip(&params) {
            self.check_arg_against(arg, param, env)?;
        }
        Ok(returns)
    }

    fn check_airref(
        &mut self,
        ns: &str,
        name: &str,
        args: &[String],
    ) -> Result<SpiralType, SpiralError> {
        let signature = self
            .defs()
            .lookup(ns, name)
            .map(|def| (def.result.clone(), def.params.len()));
        let Some((result, param_count)) = signature else {
            let names = self.defs().names();
            let suggestion = suggest_name(
                &format!("{ns}:{name}"),
                names.iter().map(String::as_str),
            );
            return Err(SpiralError::UnknownDefinition {
                ns: ns.to_string(),
                name: name.to_string(),
                suggestion,
            });
        };

        if args.len() != param_count {
            return Err(SpiralError::Arity {
                context: format!("{} (airRef {ns}:{name})", self.context()),
                expected: param_count,
                actual: args.len(),
            });
        }
        for arg in args {
            if !self.node_types.contains_key(arg) {
                return Err(SpiralError::validation(format!(
                    "{}: airRef argument '{arg}' must be a type-checked node",
                    self.context()
                )));
            }
        }
        Ok(result)
    }

    fn check_lambda(
        &mut self,
        params: &[spiral_core::expr::LambdaParam],
        body: &str,
        ty: &SpiralType,
        env: &TypeEnv,
    ) -> Result<SpiralType, SpiralError> {
        let Some((param_types, returns, _)) = ty.as_fn_parts() else {
            return Err(SpiralError::TypeMismatch {
                context: self.context(),
                expected: "fn".into(),
                actual: ty.to_string(),
            });
        };
        let param_types = param_types.to_vec();
        let returns = returns.clone();

        if params.len() != param_types.len() {
            return Err(SpiralError::Arity {
                context: format!("{} (lambda parameters)", self.context()),
                expected: param_types.len(),
                actual: params.len(),
            });
        }

        if let Some(known) = self.node_types.get(body) {
            let known = known.clone();
            self.expect_type(&returns, &known)?;
        } else if let Some(body_expr) = self.node_expr(body).cloned() {
            let inner = env.extend_many(
                params
                    .iter()
                    .map(|p| p.name.clone())
                    .zip(param_types.iter().cloned())
                    .collect::<Vec<_>>(),
            );
            let body_ty = self.check_expr(&body_expr, &inner)?;
            self.node_types.insert(body.to_string(), body_ty.clone());
            self.expect_type(&returns, &body_ty)?;
        }
        Ok(ty.clone())
    }

    fn check_callexpr(
        &mut self,
        func: &str,
        args: &[Arg],
        env: &TypeEnv,
    ) -> Result<SpiralType, SpiralError> {
        let fn_ty = if let Some(t) = env.lookup(func) {
            Some(t.clone())
        } else {
            self.node_type_on_demand(func)?
        };

        let Some(fn_ty) = fn_ty else {
            if self.is_deferred_name(func) {
                // Applied parameter: nothing to verify until bound.
                return Ok(SpiralType::Int);
            }
            return Err(SpiralError::validation(format!(
                "{}: callExpr target '{func}' is not a typed node",
                self.context()
            )));
        };

        let Some((params, returns, optional)) = fn_ty.as_fn_parts() else {
            return Err(SpiralError::TypeMismatch {
                context: self.context(),
                expected: "fn".into(),
                actual: fn_ty.to_string(),
            });
        };
        let params = params.to_vec();
        let returns = returns.clone();
        let optional = optional.map(<[bool]>::to_vec);

        if args.len() > params.len() {
            return Err(SpiralError::Arity {
                context: format!("{} (callExpr '{func}')", self.context()),
                expected: params.len(),
                actual: args.len(),
            });
        }
        for (arg, param) in args.iter().zip(&params) {
            self.check_arg_against(arg, param, env)?;
        }
        if args.len() < params.len() {
            // Short argument lists partially apply.
            let rest = params[args.len()..].to_vec();
            let rest_optional = optional.and_then(|o| o.get(args.len()..).map(<[bool]>::to_vec));
            return Ok(match rest_optional {
                Some(o) => SpiralType::function_with_optional(rest, returns, o),
                None => SpiralType::function(rest, returns),
            });
        }
        Ok(returns)
    }

    fn check_fix(&mut self, func: &str, ty: &SpiralType) -> Result<SpiralType, SpiralError> {
        let Some(fn_ty) = self.node_type_on_demand(func)? else {
            return Err(SpiralError::validation(format!(
                "{}: fix target '{func}' is not a typed node",
                self.context()
            )));
        };
        let endo = match fn_ty.as_fn_parts() {
            Some((params, returns, _)) if params.len() == 1 && &params[0] == returns => {
                Some(returns.clone())
            }
            _ => None,
        };
        let Some(inner) = endo else {
            return Err(SpiralError::TypeMismatch {
                context: self.context(),
                expected: "fn([T], T)".into(),
                actual: fn_ty.to_string(),
            });
        };
        self.expect_type(&inner, ty)?;
        Ok(inner)
    }

    fn check_match(
        &mut self,
        value: &Arg,
        cases: &[MatchCase],
        default: Option<&Arg>,
        env: &TypeEnv,
    ) -> Result<SpiralType, SpiralError> {
        self.arg_type(value, env)?;
        if cases.is_empty() && default.is_none() {
            return Err(SpiralError::validation(format!(
                "{}: match needs at least one arm or a default",
                self.context()
            )));
        }
        let mut joined: Option<SpiralType> = None;
        for case in cases {
            if let Some(t) = self.arg_type(&case.body, env)? {
                match &joined {
                    Some(existing) => self.expect_type(existing, &t)?,
                    None => joined = Some(t),
                }
            }
        }
        if let Some(d) = default {
            if let Some(t) = self.arg_type(d, env)? {
                match &joined {
                    Some(existing) => self.expect_type(existing, &t)?,
                    None => joined = Some(t),
                }
            }
        }
        Ok(joined.unwrap_or(SpiralType::Int))
    }

    fn check_record(
        &mut self,
        fields: &[RecordField],
        env: &TypeEnv,
    ) -> Result<SpiralType, SpiralError> {
        let mut field_ty: Option<SpiralType> = None;
        for field in fields {
            if let Some(t) = self.arg_type(&field.value, env)? {
                match &field_ty {
                    Some(existing) => self.expect_type(existing, &t)?,
                    None => field_ty = Some(t),
                }
            }
        }
        Ok(SpiralType::map(
            SpiralType::String,
            field_ty.unwrap_or(SpiralType::Int),
        ))
    }
}
