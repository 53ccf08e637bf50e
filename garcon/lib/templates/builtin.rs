//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The built-in Minecraft (Java edition) template document.
pub(crate) const MINECRAFT_TEMPLATE: &str = r#"id: minecraft
name: Minecraft (Java)
description: Vanilla or modded Minecraft Java servers run from a server.jar
mode: container
container:
  image: eclipse-temurin:21-jre
  mountPath: /data
  environment:
    JAVA_OPTS: -Xmx2G
exec:
  command: "java {JAVA_OPTS} -jar server.jar nogui"
  stopTimeoutSecs: 30
  rcon:
    enabled: true
    port: 25575
    password: garcon
    shutdownCommand: stop
ports:
  - containerPort: 25565
    protocol: tcp
    description: Game port
    userFacing: true
  - containerPort: 25575
    protocol: tcp
    description: RCON
requiredFiles:
  - server.jar
"#;

/// The built-in V Rising template document. Native mode; RCON credentials
/// are read from the game's own settings file at stop time.
pub(crate) const VRISING_TEMPLATE: &str = r#"id: vrising
name: V Rising
description: V Rising dedicated server (Windows native)
mode: native
exec:
  executable: VRisingServer.exe
  args:
    - -persistentDataPath
    - .
  stopTimeoutSecs: 60
  rcon:
    enabled: true
    port: 25575
    shutdownCommand: shutdown
    settingsFile: ServerHostSettings.json
ports:
  - containerPort: 9876
    protocol: udp
    description: Game port
    userFacing: true
  - containerPort: 9877
    protocol: udp
    description: Query port
requiredFiles:
  - VRisingServer.exe
"#;

/// All built-in template documents, keyed by template id.
pub(crate) const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("minecraft", MINECRAFT_TEMPLATE),
    ("vrising", VRISING_TEMPLATE),
];
