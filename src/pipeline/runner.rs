//! The stage loop: run each task of a stage in order, handling security
//! checks, nested jobs, exclusive tags and tasks added while running.

use super::calltask::call_task;
use super::security;
use super::{PipelineRequest, PipelineType, Stage, TaskSpec, Worker, start_pipeline};
use crate::bot::Bot;
use crate::events::Event;
use crate::exclusive::Turn;
use crate::retval::TaskRetVal;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use std::sync::Arc;

const ABORTED: &str = "Pipeline aborted, exclusive lock failed";

fn emit_start_event(bot: &Bot, ptype: PipelineType, command: &str) {
    let event = match ptype {
        PipelineType::PluginCommand if command == "init" => return,
        PipelineType::PluginCommand => Event::CommandPluginRan,
        PipelineType::PluginMessage => Event::AmbientPluginRan,
        PipelineType::CatchAll => Event::CatchAllRan,
        PipelineType::JobTrigger => Event::TriggeredTaskRan,
        PipelineType::SpawnedTask => Event::SpawnedTaskRan,
        PipelineType::Scheduled | PipelineType::InitJob => Event::ScheduledTaskRan,
        PipelineType::JobCommand => Event::JobTaskRan,
    };
    bot.events.emit(event);
}

/// Run the tasks of one stage. In the primary stage the first non-normal
/// result stops the stage; final and fail stages always run every task.
/// Boxed because tasks added mid-stage run in a nested call.
pub fn run_stage(
    bot: Arc<Bot>,
    worker: Arc<Worker>,
    stage: Stage,
    tasks: Vec<TaskSpec>,
    initial: bool,
) -> BoxFuture<'static, TaskRetVal> {
    async move {
        let mut tasks = tasks;
        let mut ret = TaskRetVal::Normal;
        let mut event_emitted = false;
        worker.state().stage = stage;

        let mut i = 0;
        while i < tasks.len() {
            let spec = tasks[i].clone();
            let task = spec.task.clone();
            let is_plugin = task.is_plugin();
            let is_job = task.is_job();
            {
                let mut state = worker.state();
                state.stage = stage;
                state.task = Some(task.clone());
                state.task_name = task.name().to_string();
                state.task_type = task.type_name();
                state.command = if is_plugin { spec.command.clone() } else { String::new() };
                state.args = spec.args.clone();
            }

            if stage == Stage::Primary && (is_job || is_plugin) && !worker.automatic {
                ret = security::check_all(&bot, &worker, &spec).await;
                if ret != TaskRetVal::Success {
                    ret = TaskRetVal::Fail;
                    break;
                }
            }

            if initial && !event_emitted {
                event_emitted = true;
                emit_start_event(&bot, worker.ptype, &spec.command);
            }

            worker.section(task.name(), &task.common.description);
            if is_job && i != 0 {
                let request = PipelineRequest {
                    task: task.clone(),
                    ptype: PipelineType::JobCommand,
                    command: spec.command.clone(),
                    args: spec.args.clone(),
                    envelope: worker.envelope(),
                    automatic: worker.automatic,
                    cmd_mode: worker.cmd_mode.clone(),
                    parent: Some(worker.clone()),
                };
                ret = start_pipeline(bot.clone(), request).await;
            } else {
                let (task_ret, err_string) = call_task(&bot, &worker, &spec).await;
                ret = task_ret;
                worker.state().err_string = err_string;
            }

            if stage == Stage::Final && ret != TaskRetVal::Normal {
                worker.state().final_failed.push(task.name().to_string());
            }
            if stage == Stage::Primary && ret != TaskRetVal::Normal {
                break;
            }

            let (exclusive, abort, queue, tag, pipe_name) = {
                let state = worker.state();
                (
                    state.exclusive,
                    state.abort_pipeline,
                    state.queue_task,
                    state.exclusive_tag.clone(),
                    state.pipe_name.clone(),
                )
            };
            if !exclusive {
                if abort {
                    ret = TaskRetVal::PipelineAborted;
                    if !is_plugin {
                        worker.state().err_string = ABORTED.into();
                    }
                    break;
                }
                if queue {
                    {
                        let mut state = worker.state();
                        state.queue_task = false;
                        state.exclusive = true;
                    }
                    match bot.run_queues.enqueue(&tag) {
                        Turn::Acquired => {
                            // Released while the task was finishing; run it again holding the tag.
                            tracing::debug!(%tag, pipeline = %pipe_name, "exclusive lock acquired");
                            worker.state().next_tasks.clear();
                            continue;
                        }
                        Turn::Queued(wake) => {
                            let announce = task.job().is_some_and(|job| !job.quiet)
                                || worker.ptype == PipelineType::JobCommand;
                            tracing::debug!(%tag, id = worker.id, waiting = bot.run_queues.waiting(&tag),
                                "exclusive task in progress, queueing");
                            if announce {
                                bot.say(
                                    &worker.envelope(),
                                    &format!("Queueing task '{}' in pipeline '{pipe_name}'", task.name()),
                                )
                                .await;
                            }
                            tokio::select! {
                                _ = wake => {}
                                _ = worker.cancel.cancelled() => {
                                    tracing::info!(%tag, "robot stopping while pipeline queued");
                                    worker.state().exclusive = false;
                                    ret = TaskRetVal::RobotStopping;
                                    break;
                                }
                            }
                            tracing::debug!(id = worker.id, task = task.name(), "queued pipeline waking up");
                            if announce {
                                bot.say(
                                    &worker.envelope(),
                                    &format!("Re-starting queued task '{}' in pipeline '{pipe_name}'", task.name()),
                                )
                                .await;
                            }
                            worker.state().next_tasks.clear();
                            continue;
                        }
                    }
                }
            }

            if stage == Stage::Primary {
                let added = std::mem::take(&mut worker.state().next_tasks);
                if !added.is_empty() {
                    if i == tasks.len() - 1 {
                        tasks.extend(added);
                    } else {
                        ret = run_stage(bot.clone(), worker.clone(), stage, added, false).await;
                    }
                    if worker.state().abort_pipeline {
                        ret = TaskRetVal::PipelineAborted;
                        if !is_plugin {
                            worker.state().err_string = ABORTED.into();
                        }
                        break;
                    }
                    if ret != TaskRetVal::Normal {
                        break;
                    }
                }
            }
            i += 1;
        }
        ret
    }
    .boxed()
}

