//! 表达式求值
//!
//! 基于 minijinja 的表达式与模板求值：`if` 与 `each.list` 走表达式
//! 求值，`${...}` 占位符走模板替换。求值作用域为作业上下文
//! （`inputs` / `tasks` / `outputs`），外加少量纯函数。

use std::collections::HashMap;

use chrono::Utc;
use minijinja::syntax::SyntaxConfig;
use minijinja::value::{Value, ValueKind};
use minijinja::Environment;
use rand::Rng;

use conveyor_domain::{JobContext, Task};
use conveyor_errors::{EngineError, EngineResult};

/// 表达式求值器
///
/// 环境构造一次后可跨任务复用，内部不持有可变状态。
pub struct Evaluator {
    env: Environment<'static>,
}

impl Evaluator {
    pub fn new() -> Self {
        let mut env = Environment::new();
        // 模板占位符使用 ${...} 形式
        if let Ok(syntax) = SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .build()
        {
            env.set_syntax(syntax);
        }
        env.add_function("randomInt", random_int);
        env.add_function("now", now_rfc3339);
        env.add_function("fmtDate", fmt_date);
        Self { env }
    }

    /// 对 `if` 表达式求布尔值
    ///
    /// 字符串结果按 "true"/"false" 解释，其余类型按真值规则处理。
    pub fn eval_bool(&self, expr: &str, ctx: &JobContext) -> EngineResult<bool> {
        let value = self.eval_expr(expr, ctx, &HashMap::new())?;
        if value.kind() == ValueKind::String {
            return Ok(value
                .as_str()
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false));
        }
        Ok(value.is_true())
    }

    /// 对 `each.list` 表达式求序列
    pub fn eval_list(
        &self,
        expr: &str,
        ctx: &JobContext,
    ) -> EngineResult<Vec<serde_json::Value>> {
        let value = self.eval_expr(expr, ctx, &HashMap::new())?;
        let iter = value
            .try_iter()
            .map_err(|e| EngineError::Eval(format!("列表表达式 {expr} 求值失败: {e}")))?;
        let mut items = Vec::new();
        for item in iter {
            items.push(serde_json::to_value(&item)?);
        }
        Ok(items)
    }

    /// 渲染单个 `${...}` 模板；不含占位符的字符串原样返回
    pub fn render(&self, template: &str, ctx: &JobContext) -> EngineResult<String> {
        self.render_with(template, ctx, &HashMap::new())
    }

    /// 带额外绑定的模板渲染（用于 each 子任务的元素绑定）
    pub fn render_with(
        &self,
        template: &str,
        ctx: &JobContext,
        extra: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<String> {
        if !template.contains("${") {
            return Ok(template.to_string());
        }
        self.env
            .render_str(template, self.scope(ctx, extra))
            .map_err(|e| EngineError::Eval(format!("模板 {template} 渲染失败: {e}")))
    }

    /// 渲染任务的全部模板字段
    pub fn evaluate_task(&self, task: &mut Task, ctx: &JobContext) -> EngineResult<()> {
        self.evaluate_task_with(task, ctx, &HashMap::new())
    }

    /// 带额外绑定渲染任务的全部模板字段
    pub fn evaluate_task_with(
        &self,
        task: &mut Task,
        ctx: &JobContext,
        extra: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<()> {
        task.name = self.render_with(&task.name, ctx, extra)?;
        task.image = self.render_with(&task.image, ctx, extra)?;
        task.run = self.render_with(&task.run, ctx, extra)?;
        for item in task.cmd.iter_mut() {
            *item = self.render_with(item, ctx, extra)?;
        }
        let mut env = HashMap::with_capacity(task.env.len());
        for (key, value) in &task.env {
            env.insert(key.clone(), self.render_with(value, ctx, extra)?);
        }
        task.env = env;
        let mut files = HashMap::with_capacity(task.files.len());
        for (key, value) in &task.files {
            files.insert(key.clone(), self.render_with(value, ctx, extra)?);
        }
        task.files = files;
        if let Some(subjob) = &mut task.subjob {
            let mut inputs = HashMap::with_capacity(subjob.inputs.len());
            for (key, value) in &subjob.inputs {
                inputs.insert(key.clone(), self.render_with(value, ctx, extra)?);
            }
            subjob.inputs = inputs;
        }
        Ok(())
    }

    fn eval_expr(
        &self,
        expr: &str,
        ctx: &JobContext,
        extra: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<Value> {
        let compiled = self
            .env
            .compile_expression(expr)
            .map_err(|e| EngineError::Eval(format!("表达式 {expr} 编译失败: {e}")))?;
        compiled
            .eval(self.scope(ctx, extra))
            .map_err(|e| EngineError::Eval(format!("表达式 {expr} 求值失败: {e}")))
    }

    /// 求值作用域：作业上下文字段在顶层展开，额外绑定覆盖在上面
    fn scope(&self, ctx: &JobContext, extra: &HashMap<String, serde_json::Value>) -> Value {
        let mut scope = serde_json::Map::new();
        scope.insert(
            "inputs".to_string(),
            serde_json::to_value(&ctx.inputs).unwrap_or_default(),
        );
        scope.insert(
            "tasks".to_string(),
            serde_json::to_value(&ctx.tasks).unwrap_or_default(),
        );
        scope.insert(
            "outputs".to_string(),
            serde_json::to_value(&ctx.outputs).unwrap_or_default(),
        );
        for (key, value) in extra {
            scope.insert(key.clone(), value.clone());
        }
        Value::from_serialize(&scope)
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn random_int(max: Option<i64>) -> i64 {
    let max = max.unwrap_or(i64::MAX);
    if max <= 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..max)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn fmt_date(value: String, format: String) -> Result<String, minijinja::Error> {
    let parsed = chrono::DateTime::parse_from_rfc3339(&value).map_err(|e| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("invalid rfc3339 date: {e}"),
        )
    })?;
    Ok(parsed.format(&format).to_string())
}
