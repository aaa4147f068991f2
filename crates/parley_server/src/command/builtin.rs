#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_hub::ChatEvent;
use parley_protocol::Envelope;
use parley_protocol::time::unix_ms_now;

use super::registry::{CommandContext, CommandError, CommandRegistry, CommandSpec, LEVEL_ADMIN, LEVEL_USER};

/// Register the built-in command set.
pub fn register_builtins(registry: &Arc<CommandRegistry>) -> Result<(), super::RegisterError> {
	registry.register(
		{
			let registry = Arc::clone(registry);
			CommandSpec::new("help", "查看帮助", LEVEL_USER, move |ctx| {
				let mut lines = Vec::new();
				for cmd in registry.list() {
					let aliases = if cmd.aliases.is_empty() {
						String::new()
					} else {
						format!(" (别名: {})", cmd.aliases.join(", "))
					};
					lines.push(format!("/{} - {}{}", cmd.name, cmd.help, aliases));
				}
				ctx.client.send(Envelope::text(lines.join("\n")));
				Ok(())
			})
		}
		.with_aliases(&["h"]),
	)?;

	registry.register(
		CommandSpec::new("who", "查看在线用户", LEVEL_USER, |ctx| {
			let names = ctx.hub.list_names();
			ctx.client.send(Envelope::text(format!("在线用户：{}", names.join(","))));
			Ok(())
		})
		.with_aliases(&["list", "w"]),
	)?;

	registry.register(
		CommandSpec::new("quit", "退出聊天室", LEVEL_USER, |ctx| {
			ctx.client.send(Envelope::text("再见！"));
			ctx.hub.unregister_client(ctx.client);
			Ok(())
		})
		.with_aliases(&["q", "exit"]),
	)?;

	registry.register(
		CommandSpec::new("msg", "私聊: /msg <to> <text>", LEVEL_USER, |ctx| {
			if ctx.args.len() < 2 {
				return Err(CommandError::Usage("用法: /msg <to> <text>".to_string()));
			}
			let to = ctx.args[0].clone();
			let content = ctx.args[1..].join(" ");
			ctx.hub.emit(ChatEvent::MessageDirect {
				when: unix_ms_now(),
				from: ctx.client.name(),
				to,
				content,
			});
			Ok(())
		})
		.with_aliases(&["dm"]),
	)?;

	registry.register(CommandSpec::new(
		"notice",
		"系统通知广播: /notice <info|warn|error> <text>",
		LEVEL_USER,
		|ctx| {
			if ctx.args.len() < 2 {
				return Err(CommandError::Usage("用法: /notice <info|warn|error> <text>".to_string()));
			}
			let level = ctx.args[0].to_ascii_lowercase();
			if !matches!(level.as_str(), "info" | "warn" | "error") {
				return Err(CommandError::Usage("用法: /notice <info|warn|error> <text>".to_string()));
			}
			ctx.hub.emit(ChatEvent::SystemNotice {
				when: unix_ms_now(),
				level,
				content: ctx.args[1..].join(" "),
			});
			Ok(())
		},
	))?;

	registry.register(CommandSpec::new("ping", "发送心跳: /ping [detail]", LEVEL_USER, |ctx| {
		ctx.hub.emit(ChatEvent::Heartbeat {
			when: unix_ms_now(),
			from_id: ctx.client.id().to_string(),
			detail: ctx.args.join(" "),
		});
		ctx.client.send(Envelope::text("pong"));
		Ok(())
	}))?;

	registry.register(CommandSpec::new(
		"sendfile",
		"发送文件: /sendfile <to|*> <name> <size> [mime]",
		LEVEL_USER,
		|ctx| {
			if ctx.args.len() < 3 {
				return Err(CommandError::Usage("用法: /sendfile <to|*> <name> <size> [mime]".to_string()));
			}
			let size: i64 = ctx.args[2]
				.parse()
				.map_err(|_| CommandError::Usage(format!("size 不是整数: {}", ctx.args[2])))?;

			ctx.hub.emit(ChatEvent::FileTransfer {
				when: unix_ms_now(),
				from: ctx.client.name(),
				to: ctx.args[0].clone(),
				name: ctx.args[1].clone(),
				size,
				mime: ctx.args.get(3).cloned().unwrap_or_default(),
			});
			ctx.client.send(Envelope::text(format!("文件事件已提交: {}", ctx.args[1])));
			Ok(())
		},
	))?;

	registry.register(CommandSpec::new("kick", "踢出用户: /kick <name>", LEVEL_ADMIN, |ctx| {
		let name = require_arg(ctx, 0, "用法: /kick <name>")?;
		if ctx.hub.kick_by_name(&name) {
			ctx.client.send(Envelope::text(format!("已踢出: {name}")));
		} else {
			ctx.client.send(Envelope::text(format!("用户不在线或不存在: {name}")));
		}
		Ok(())
	}))?;

	registry.register(CommandSpec::new(
		"ban",
		"封禁用户: /ban <name> [minutes]，不填分钟为永久",
		LEVEL_ADMIN,
		|ctx| {
			let name = require_arg(ctx, 0, "用法: /ban <name> [minutes]")?;
			let duration = match ctx.args.get(1) {
				None => None,
				Some(m) => {
					let minutes: u64 = m
						.parse()
						.map_err(|_| CommandError::Usage(format!("minutes 不是整数: {m}")))?;
					if minutes == 0 { None } else { Some(Duration::from_secs(minutes * 60)) }
				}
			};

			ctx.hub.ban_for(name.clone(), duration);
			ctx.hub.kick_by_name(&name);
			ctx.client.send(Envelope::text(format!("已封禁: {name}")));
			Ok(())
		},
	))?;

	registry.register(CommandSpec::new("auth", "设置权限: /auth <0|1>", LEVEL_USER, |ctx| {
		let level = require_arg(ctx, 0, "用法: /auth <0|1>")?;
		if level != "0" && level != "1" {
			return Err(CommandError::Usage("用法: /auth <0|1>".to_string()));
		}
		ctx.client.meta_set("level", level.clone());
		ctx.client.send(Envelope::text(format!("权限已更新: level={level}")));
		Ok(())
	}))?;

	Ok(())
}

fn require_arg(ctx: &CommandContext<'_>, idx: usize, usage: &str) -> Result<String, CommandError> {
	ctx.args.get(idx).cloned().ok_or_else(|| CommandError::Usage(usage.to_string()))
}
