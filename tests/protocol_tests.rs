use obswatch::config::{MountPolicy, ShutdownStep, ShutdownTrigger};
use obswatch::error::ProtocolError;
use obswatch::protocol::*;

#[test]
fn test_command_parsing_valid() {
    let handler = ProtocolHandler::new();

    let ping_json = r#"{"id":123,"timestamp":1000,"command_type":"Ping"}"#;
    let command = handler.parse_command(ping_json).unwrap();
    assert_eq!(command.id, 123);
    assert_eq!(command.timestamp, 1000);
    assert!(matches!(command.command_type, CommandType::Ping));
}

#[test]
fn test_command_parsing_property_writes() {
    let handler = ProtocolHandler::new();

    let heartbeat = r#"{"id":1,"timestamp":0,"command_type":{"Heartbeat":{"interval_seconds":60}}}"#;
    assert_eq!(
        handler.parse_command(heartbeat).unwrap().command_type,
        CommandType::Heartbeat { interval_seconds: 60 }
    );

    let steps = r#"{"id":2,"timestamp":0,"command_type":{"SetShutdownSteps":{"steps":["ParkMount","RunScript"]}}}"#;
    assert_eq!(
        handler.parse_command(steps).unwrap().command_type,
        CommandType::SetShutdownSteps {
            steps: vec![ShutdownStep::ParkMount, ShutdownStep::RunScript]
        }
    );

    let triggers = r#"{"id":3,"timestamp":0,"command_type":{"SetShutdownTriggers":{"triggers":["Weather"]}}}"#;
    assert_eq!(
        handler.parse_command(triggers).unwrap().command_type,
        CommandType::SetShutdownTriggers {
            triggers: vec![ShutdownTrigger::Weather]
        }
    );

    let policy = r#"{"id":4,"timestamp":0,"command_type":{"SetMountPolicy":{"policy":"Locks"}}}"#;
    assert_eq!(
        handler.parse_command(policy).unwrap().command_type,
        CommandType::SetMountPolicy {
            policy: MountPolicy::Locks
        }
    );

    let devices = r#"{"id":5,"timestamp":0,"command_type":{"SetActiveDevices":{"telescope":null,"dome":"Roll-off Roof","weather":null}}}"#;
    if let CommandType::SetActiveDevices { telescope, dome, weather } =
        handler.parse_command(devices).unwrap().command_type
    {
        assert!(telescope.is_none());
        assert_eq!(dome.as_deref(), Some("Roll-off Roof"));
        assert!(weather.is_none());
    } else {
        panic!("Expected SetActiveDevices command type");
    }
}

#[test]
fn test_command_parsing_invalid() {
    let handler = ProtocolHandler::new();

    assert_eq!(
        handler.parse_command("{not json").unwrap_err(),
        ProtocolError::InvalidJson
    );
    assert_eq!(
        handler
            .parse_command(r#"{"id":1,"timestamp":0,"command_type":"Reboot"}"#)
            .unwrap_err(),
        ProtocolError::InvalidJson
    );

    let oversized = format!(
        r#"{{"id":1,"timestamp":0,"command_type":{{"SetScriptPath":{{"path":"{}"}}}}}}"#,
        "x".repeat(MAX_COMMAND_SIZE)
    );
    assert_eq!(
        handler.parse_command(&oversized).unwrap_err(),
        ProtocolError::MessageTooLarge
    );
}

#[test]
fn test_command_validation() {
    let handler = ProtocolHandler::new();

    let zero_id = Command {
        id: 0,
        timestamp: 0,
        command_type: CommandType::Ping,
    };
    assert_eq!(
        handler.validate_command(&zero_id),
        Err(ProtocolError::InvalidCommand)
    );

    let huge_threshold = Command {
        id: 1,
        timestamp: 0,
        command_type: CommandType::SetWeatherThreshold {
            seconds: MAX_THRESHOLD_SECONDS + 1,
        },
    };
    assert_eq!(
        handler.validate_command(&huge_threshold),
        Err(ProtocolError::InvalidParameter)
    );

    let empty_devices = Command {
        id: 1,
        timestamp: 0,
        command_type: CommandType::SetActiveDevices {
            telescope: None,
            dome: None,
            weather: None,
        },
    };
    assert_eq!(
        handler.validate_command(&empty_devices),
        Err(ProtocolError::InvalidParameter)
    );

    let heartbeat = Command {
        id: 1,
        timestamp: 0,
        command_type: CommandType::Heartbeat {
            interval_seconds: MAX_THRESHOLD_SECONDS,
        },
    };
    assert!(handler.validate_command(&heartbeat).is_ok());
}

#[test]
fn test_response_creation() {
    let handler = ProtocolHandler::new();

    let response = handler.create_rejected_response(42, "shutdown script file is not set");
    assert_eq!(response.id, 42);
    assert_eq!(response.status, ResponseStatus::Rejected);

    let json = handler.serialize_response(&response).unwrap();
    assert!(json.contains(r#""status":"Rejected""#));
    assert!(json.contains("shutdown script file is not set"));

    let ok = handler.create_response(43, ResponseStatus::Success, None);
    assert!(ok.message.is_none());
}
