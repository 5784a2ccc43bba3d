//! The `memory` plugin: a shared list of long-term "facts" in the brain,
//! plus short-term per-user, per-channel memories.

use crate::retval::{RetVal, TaskRetVal};
use crate::robot::{Robot, TaskHandler};

use async_trait::async_trait;
use serde_json::Value;

pub const CONFIG: &str = r#"
AllChannels: true
AllowDirect: true
Help:
- Keywords: [ "remember", "memory" ]
  Helptext: [ "(bot), remember <anything> - prove the robot has a brain(tm)" ]
- Keywords: [ "recall", "memory" ]
  Helptext: [ "(bot), recall (#) - list everything remembered, or recall one item" ]
- Keywords: [ "forget", "memory" ]
  Helptext: [ "(bot), forget <#> - ask the robot to forget one of its remembered 'facts'" ]
- Keywords: [ "store", "memory" ]
  Helptext: [ "(bot), store <thing> is <value> - remember something for a few minutes" ]
- Keywords: [ "what", "memory" ]
  Helptext: [ "(bot), what is <thing>? - recall something stored a moment ago" ]
CommandMatchers:
- Command: remember
  Regex: '(?i:remember(?: (slowly))? ([-\w .,!?:/]+))'
- Command: recall
  Regex: '(?i:recall ?(\d+)?)'
- Command: forget
  Regex: '(?i:forget (\d{1,2}))'
- Command: store
  Regex: '(?i:store ([-\w .,!:/]+?) is ([-\w .,!?:/]+))'
- Command: whatis
  Regex: '(?i:what is ([-\w .,!:/]+?)\??)'
"#;

/// Brain key of the long-term list.
const MEMORY_KEY: &str = "memory";

pub struct Memory;

fn facts(datum: Option<Value>) -> Vec<String> {
    datum
        .and_then(|datum| serde_json::from_value(datum).ok())
        .unwrap_or_default()
}

/// A 1-based item number from a command argument.
fn item_index(arg: &str, len: usize) -> Option<usize> {
    let number: usize = arg.trim().parse().ok()?;
    (1..=len).contains(&number).then(|| number - 1)
}

impl Memory {
    async fn remember(&self, robot: &Robot, slowly: bool, thing: &str) -> TaskRetVal {
        let checkout = robot.check_out_datum(MEMORY_KEY, true).await;
        if checkout.ret != RetVal::Ok {
            robot.say("Sorry, I'm having trouble checking out my memory").await;
            return TaskRetVal::MechanismFail;
        }
        let mut facts = facts(checkout.datum);
        if facts.iter().any(|fact| fact == thing) {
            robot.say("That's already one of my fondest memories").await;
            robot.check_in_datum(MEMORY_KEY, &checkout.lock_token).await;
            return TaskRetVal::Normal;
        }
        facts.push(thing.to_string());
        if slowly {
            robot
                .say(&format!("Ok, I'll remember \"{thing}\" ... but sloooowly"))
                .await;
            robot.pause(2.0).await;
        } else {
            robot.say(&format!("Ok, I'll remember \"{thing}\"")).await;
        }
        let ret = robot
            .update_datum(MEMORY_KEY, &checkout.lock_token, &Value::from(facts))
            .await;
        if ret != RetVal::Ok {
            robot.say("Dang it, having problems with my memory").await;
            return TaskRetVal::MechanismFail;
        }
        if !slowly {
            robot.say("committed to memory").await;
        }
        TaskRetVal::Normal
    }

    async fn recall(&self, robot: &Robot, which: &str) -> TaskRetVal {
        let checkout = robot.check_out_datum(MEMORY_KEY, false).await;
        if checkout.ret != RetVal::Ok {
            robot.say("Sorry - trouble checking memory!").await;
            return TaskRetVal::MechanismFail;
        }
        let facts = facts(checkout.datum);
        if facts.is_empty() {
            robot.say("Sorry - I don't remember anything!").await;
            return TaskRetVal::Normal;
        }
        if which.is_empty() {
            let listing: Vec<String> = facts
                .iter()
                .enumerate()
                .map(|(index, fact)| format!("#{}: {fact}", index + 1))
                .collect();
            robot
                .say(&format!("Here's what I remember:\n{}", listing.join("\n")))
                .await;
        } else {
            match item_index(which, facts.len()) {
                Some(index) => robot.say(&facts[index]).await,
                None => robot.say("I don't remember that many things!").await,
            };
        }
        TaskRetVal::Normal
    }

    async fn forget(&self, robot: &Robot, which: &str) -> TaskRetVal {
        let checkout = robot.check_out_datum(MEMORY_KEY, true).await;
        if checkout.ret != RetVal::Ok {
            robot.say("Sorry - trouble checking memory!").await;
            return TaskRetVal::MechanismFail;
        }
        let mut facts = facts(checkout.datum);
        let Some(index) = item_index(which, facts.len()) else {
            robot.check_in_datum(MEMORY_KEY, &checkout.lock_token).await;
            robot
                .say("Gosh, I guess I never remembered that in the first place!")
                .await;
            return TaskRetVal::Normal;
        };
        let item = facts.remove(index);
        robot.say(&format!("Ok, I'll forget \"{item}\"")).await;
        let ret = robot
            .update_datum(MEMORY_KEY, &checkout.lock_token, &Value::from(facts))
            .await;
        if ret != RetVal::Ok {
            robot.say("Hmm, having trouble forgetting that item for real, sorry").await;
            return TaskRetVal::MechanismFail;
        }
        TaskRetVal::Normal
    }
}

#[async_trait]
impl TaskHandler for Memory {
    async fn run(&self, robot: &Robot, command: &str, args: &[String]) -> TaskRetVal {
        let arg = |index: usize| args.get(index).map(|arg| arg.trim()).unwrap_or_default();
        match command {
            "remember" => self.remember(robot, !arg(0).is_empty(), arg(1)).await,
            "recall" => self.recall(robot, arg(0)).await,
            "forget" => self.forget(robot, arg(0)).await,
            "store" => {
                let (thing, value) = (arg(0), arg(1));
                robot.remember(thing, value, false);
                robot
                    .say(&format!("I'll remember \"{thing}\" is \"{value}\" - but eventually I'll forget!"))
                    .await;
                TaskRetVal::Normal
            }
            "whatis" => {
                let thing = arg(0);
                let value = robot.recall(thing, false);
                if value.is_empty() {
                    robot.reply(&format!("Gosh, I have no idea what \"{thing}\" is")).await;
                } else {
                    robot.say(&format!("{thing} is {value}")).await;
                }
                TaskRetVal::Normal
            }
            _ => TaskRetVal::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_numbers_are_one_based_and_bounded() {
        assert_eq!(item_index("1", 3), Some(0));
        assert_eq!(item_index("3", 3), Some(2));
        assert_eq!(item_index("0", 3), None);
        assert_eq!(item_index("4", 3), None);
        assert_eq!(item_index("x", 3), None);
    }

    #[test]
    fn malformed_memory_reads_as_empty() {
        assert!(facts(None).is_empty());
        assert!(facts(Some(json!({"not": "a list"}))).is_empty());
        assert_eq!(facts(Some(json!(["The Alamo"]))), vec!["The Alamo".to_string()]);
    }
}
